//! # Render Target Formats
//!
//! Translation from API formats to CB/DB hardware encodings.

use ember_core::GfxLevel;

use crate::regs::{stencil_format, z_format};

/// CB_COLOR_INFO.FORMAT encodings
pub mod color_format {
    pub const INVALID: u32 = 0;
    pub const C_8: u32 = 1;
    pub const C_16: u32 = 2;
    pub const C_8_8: u32 = 3;
    pub const C_32: u32 = 4;
    pub const C_16_16: u32 = 5;
    pub const C_10_11_11: u32 = 6;
    pub const C_11_11_10: u32 = 7;
    pub const C_10_10_10_2: u32 = 8;
    pub const C_2_10_10_10: u32 = 9;
    pub const C_8_8_8_8: u32 = 10;
    pub const C_32_32: u32 = 11;
    pub const C_16_16_16_16: u32 = 12;
    pub const C_32_32_32_32: u32 = 14;
    pub const C_5_6_5: u32 = 16;
    pub const C_1_5_5_5: u32 = 17;
    pub const C_5_5_5_1: u32 = 18;
    pub const C_4_4_4_4: u32 = 19;
    pub const C_8_24: u32 = 20;
    pub const C_24_8: u32 = 21;
    pub const C_X24_8_32_FLOAT: u32 = 22;
}

/// CB_COLOR_INFO.NUMBER_TYPE encodings
pub mod number_type {
    pub const UNORM: u32 = 0;
    pub const SNORM: u32 = 1;
    pub const UINT: u32 = 4;
    pub const SINT: u32 = 5;
    pub const SRGB: u32 = 6;
    pub const FLOAT: u32 = 7;
}

/// CB_COLOR_INFO.COMP_SWAP encodings
pub mod swap {
    pub const STD: u32 = 0;
    pub const ALT: u32 = 1;
    pub const STD_REV: u32 = 2;
    pub const ALT_REV: u32 = 3;
}

/// Formats that can be bound as render targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Format {
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    R8G8B8A8Uint,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R5G6B5UnormPack16,
    A2B10G10R10UnormPack32,
    B10G11R11UfloatPack32,
    R16Sint,
    R16G16B16A16Sfloat,
    R32Uint,
    R32Sfloat,
    R32G32B32A32Sfloat,
    D16Unorm,
    X8D24UnormPack32,
    D32Sfloat,
    S8Uint,
    D16UnormS8Uint,
    D24UnormS8Uint,
    D32SfloatS8Uint,
}

impl Format {
    /// Has a depth component
    pub const fn has_depth(self) -> bool {
        matches!(
            self,
            Self::D16Unorm
                | Self::X8D24UnormPack32
                | Self::D32Sfloat
                | Self::D16UnormS8Uint
                | Self::D24UnormS8Uint
                | Self::D32SfloatS8Uint
        )
    }

    /// Has a stencil component
    pub const fn has_stencil(self) -> bool {
        matches!(
            self,
            Self::S8Uint | Self::D16UnormS8Uint | Self::D24UnormS8Uint | Self::D32SfloatS8Uint
        )
    }

    /// Depth or stencil format
    pub const fn is_depth_stencil(self) -> bool {
        self.has_depth() || self.has_stencil()
    }

    /// Alpha reads as 1 (no alpha channel in memory)
    pub const fn alpha_is_one(self) -> bool {
        matches!(self, Self::R5G6B5UnormPack16 | Self::B10G11R11UfloatPack32)
    }

    /// CB format, [`color_format::INVALID`] for non-color formats
    ///
    /// The encoding is shared by all generations; GFX11 only moves the field.
    pub const fn cb_format(self, _gfx_level: GfxLevel) -> u32 {
        use color_format::*;
        match self {
            Self::R8Unorm => C_8,
            Self::R8G8Unorm => C_8_8,
            Self::R8G8B8A8Unorm
            | Self::R8G8B8A8Srgb
            | Self::R8G8B8A8Uint
            | Self::B8G8R8A8Unorm
            | Self::B8G8R8A8Srgb => C_8_8_8_8,
            Self::R5G6B5UnormPack16 => C_5_6_5,
            Self::A2B10G10R10UnormPack32 => C_2_10_10_10,
            Self::B10G11R11UfloatPack32 => C_10_11_11,
            Self::R16Sint => C_16,
            Self::R16G16B16A16Sfloat => C_16_16_16_16,
            Self::R32Uint | Self::R32Sfloat => C_32,
            Self::R32G32B32A32Sfloat => C_32_32_32_32,
            _ => INVALID,
        }
    }

    /// CB number type
    pub const fn cb_number_type(self) -> u32 {
        use number_type::*;
        match self {
            Self::R8G8B8A8Srgb | Self::B8G8R8A8Srgb => SRGB,
            Self::R8G8B8A8Uint | Self::R32Uint => UINT,
            Self::R16Sint => SINT,
            Self::B10G11R11UfloatPack32
            | Self::R16G16B16A16Sfloat
            | Self::R32Sfloat
            | Self::R32G32B32A32Sfloat => FLOAT,
            _ => UNORM,
        }
    }

    /// Component swap relative to the hardware channel order
    pub const fn color_swap(self) -> u32 {
        match self {
            Self::B8G8R8A8Unorm | Self::B8G8R8A8Srgb => swap::ALT,
            Self::R5G6B5UnormPack16 => swap::STD_REV,
            _ => swap::STD,
        }
    }

    /// DB Z format
    pub const fn db_format(self) -> u32 {
        match self {
            Self::D16Unorm | Self::D16UnormS8Uint => z_format::Z_16,
            Self::X8D24UnormPack32 | Self::D24UnormS8Uint => z_format::Z_24,
            Self::D32Sfloat | Self::D32SfloatS8Uint => z_format::Z_32_FLOAT,
            _ => z_format::INVALID,
        }
    }

    /// DB stencil format
    pub const fn db_stencil_format(self) -> u32 {
        if self.has_stencil() {
            stencil_format::STENCIL_8
        } else {
            stencil_format::INVALID
        }
    }
}

/// Endian swap for a CB format; little-endian hosts never swap
pub const fn colorformat_endian_swap(_format: u32) -> u32 {
    0
}
