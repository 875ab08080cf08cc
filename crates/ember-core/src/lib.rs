//! # EMBER Core
//!
//! Foundational types shared by every EMBER crate.
//!
//! This crate has no hardware dependencies. It provides:
//! - The backend error type and `Result` alias
//! - Strong typing for GPU virtual addresses and sizes
//! - The chip description (generation, family, tiling tables) consumed by
//!   the surface encoder and the device lifecycle code
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ember-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Error     │  │   Types     │  │     Chip            │  │
//! │  │  (backend   │  │ (GpuAddr,   │  │ (GfxLevel, Family,  │  │
//! │  │   errors)   │  │  ByteSize)  │  │  tile mode tables)  │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod chip;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use chip::{ChipFamily, ChipInfo, GfxLevel, SurfaceTier};
pub use error::{Error, Result};
pub use types::*;
