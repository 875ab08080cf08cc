//! # EMBER Surface
//!
//! Translates an image view plus its computed surface layout into the
//! register words the color buffer (CB) and depth buffer (DB) blocks consume.
//! The encoders are pure functions of the view, the image metadata and the
//! chip generation; nothing here touches memory or the kernel.
//!
//! ## Generations
//!
//! ```text
//! ┌────────────┬──────────────────────────────────────────────────┐
//! │ GFX6-8     │ tile mode indices, pitch/slice tile counts       │
//! ├────────────┼──────────────────────────────────────────────────┤
//! │ GFX9-10.3  │ swizzle modes, mip0 extents, ATTRIB3 on GFX10+   │
//! ├────────────┼──────────────────────────────────────────────────┤
//! │ GFX11+     │ moved format/fragment fields, no CB DCC enable   │
//! └────────────┴──────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod color;
pub mod depth;
#[allow(missing_docs)]
pub mod format;
pub mod image;
pub mod msaa;
#[allow(missing_docs)]
pub mod regs;

pub use color::{ColorSurfaceDescriptor, dcc_control, encode_color_surface};
pub use depth::{
    DepthStencilSurfaceDescriptor, decompress_on_z_planes, encode_depth_stencil_surface,
    encode_vrs_surface,
};
pub use format::Format;
pub use image::{
    Extent3d, Image, ImageAspects, ImageType, ImageUsage, ImageView, Metadata, NbcView,
    SubresourceLayout, Surface, SurfaceLayout, ViewType,
};
pub use msaa::{SamplePattern, SamplePositions};

/// Driver-wide switches that change the encoded state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Enable CMASK fast clears
    pub fast_clears: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self { fast_clears: true }
    }
}

static_assertions::assert_impl_all!(ColorSurfaceDescriptor: Copy, Send, Sync);
static_assertions::assert_impl_all!(DepthStencilSurfaceDescriptor: Copy, Send, Sync);
