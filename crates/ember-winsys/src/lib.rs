//! # EMBER Winsys
//!
//! The memory backend interface between the Vulkan layer and the kernel
//! driver: buffer objects (BOs), virtual address binding, CPU mapping,
//! dma-buf export and hardware contexts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ember-vulkan                            │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ dyn Winsys
//! ┌──────────────────────────┴──────────────────────────────────┐
//! │  ┌───────────────┐  ┌───────────────┐  ┌─────────────────┐  │
//! │  │  Bo / BoRef   │  │  HwCtx        │  │  NullWinsys     │  │
//! │  │  (domains,    │  │  (priority,   │  │  (accounting,   │  │
//! │  │   flags)      │  │   pstate)     │  │   VA allocator) │  │
//! │  └───────────────┘  └───────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A real backend talks to the kernel through ioctls. [`NullWinsys`] keeps
//! everything in process and is what the test suites run against.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod address_space;
pub mod bo;
pub mod ctx;
#[cfg(feature = "std")]
pub mod null;

pub use bo::{Bo, BoCreateInfo, BoDomain, BoFlags, BoHandle, BoPriority, BoRef};
pub use ctx::{CtxHandle, CtxPriority, HwCtx, Pstate};
#[cfg(feature = "std")]
pub use null::{CallStats, NullWinsys, VirtualBindRecord, WinsysCall};

use core::ptr::NonNull;

use ember_core::Result;

// =============================================================================
// WINSYS TRAIT
// =============================================================================

/// Kernel memory backend
///
/// Every method is callable from any thread. Objects returned by the backend
/// are owned by the caller and handed back to the matching destroy method.
pub trait Winsys: Send + Sync {
    /// Allocate a buffer object
    fn buffer_create(&self, info: &BoCreateInfo) -> Result<Bo>;

    /// Free a buffer object and its virtual address range
    fn buffer_destroy(&self, bo: Bo);

    /// Map (`bo = Some`) or unmap (`bo = None`) a page range of a virtual BO
    fn buffer_virtual_bind(
        &self,
        parent: &Bo,
        offset: u64,
        size: u64,
        bo: Option<&Bo>,
        bo_offset: u64,
    ) -> Result<()>;

    /// Add or remove a BO from the always-resident list
    fn buffer_make_resident(&self, bo: &Bo, resident: bool) -> Result<()>;

    /// Map a BO into the CPU address space
    ///
    /// The returned pointer covers `bo.size()` bytes and stays valid until
    /// [`Winsys::buffer_unmap`] or [`Winsys::buffer_destroy`].
    fn buffer_map(&self, bo: &Bo) -> Option<NonNull<u8>>;

    /// Drop the CPU mapping of a BO
    fn buffer_unmap(&self, bo: &Bo);

    /// Export a BO as a dma-buf file descriptor
    fn buffer_get_fd(&self, bo: &Bo) -> Result<i32>;

    /// Domain and flags an imported dma-buf would be created with
    fn buffer_get_flags_from_fd(&self, fd: i32) -> Option<(BoDomain, BoFlags)>;

    /// Import a dma-buf file descriptor
    fn buffer_from_fd(&self, fd: i32, priority: BoPriority) -> Result<Bo>;

    /// Create a hardware submission context
    fn ctx_create(&self, priority: CtxPriority) -> Result<HwCtx>;

    /// Destroy a hardware submission context
    fn ctx_destroy(&self, ctx: HwCtx);

    /// Request a stable power state on behalf of a context
    fn ctx_set_pstate(&self, ctx: &HwCtx, pstate: Pstate) -> Result<()>;

    /// Current GPU timestamp in crystal clock ticks
    fn query_gpu_timestamp(&self) -> u64;
}
