//! # Register Field Layouts
//!
//! Bit positions of the render target registers programmed by the encoders,
//! grouped per register. Where a generation moved a field, the variants carry
//! a generation suffix.

// =============================================================================
// FIELD
// =============================================================================

/// A contiguous bit field `[low, high]` inside a 32-bit register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    low: u8,
    high: u8,
}

impl Field {
    /// Field spanning bits `low..=high`
    pub const fn new(low: u8, high: u8) -> Self {
        Self { low, high }
    }

    /// Single-bit field
    pub const fn bit(bit: u8) -> Self {
        Self::new(bit, bit)
    }

    /// Mask of the field in register position
    #[inline]
    pub const fn mask(self) -> u32 {
        let width = (self.high - self.low + 1) as u32;
        let ones = ((1u64 << width) - 1) as u32;
        ones << self.low
    }

    /// Encode `value` into register position, truncating to the field width
    #[inline]
    pub const fn set(self, value: u32) -> u32 {
        (value << self.low) & self.mask()
    }

    /// Encode a flag
    #[inline]
    pub const fn flag(self, value: bool) -> u32 {
        self.set(value as u32)
    }

    /// Extract the field from a register value
    #[inline]
    pub const fn get(self, reg: u32) -> u32 {
        (reg & self.mask()) >> self.low
    }
}

// =============================================================================
// COLOR BUFFER
// =============================================================================

/// CB_COLOR0_INFO
pub mod cb_color_info {
    use super::Field;

    pub const ENDIAN: Field = Field::new(0, 1);
    pub const FORMAT_GFX6: Field = Field::new(2, 6);
    pub const FORMAT_GFX11: Field = Field::new(0, 4);
    pub const NUMBER_TYPE: Field = Field::new(8, 10);
    pub const COMP_SWAP: Field = Field::new(11, 12);
    pub const FAST_CLEAR: Field = Field::bit(13);
    pub const COMPRESSION: Field = Field::bit(14);
    pub const BLEND_CLAMP: Field = Field::bit(15);
    pub const BLEND_BYPASS: Field = Field::bit(16);
    pub const SIMPLE_FLOAT: Field = Field::bit(17);
    pub const ROUND_MODE: Field = Field::bit(18);
    pub const FMASK_COMPRESS_1FRAG_ONLY: Field = Field::bit(27);
    pub const DCC_ENABLE: Field = Field::bit(28);
    pub const CMASK_ADDR_TYPE: Field = Field::new(29, 30);
}

/// CB_COLOR0_ATTRIB
pub mod cb_color_attrib {
    use super::Field;

    // GFX6-8
    pub const TILE_MODE_INDEX: Field = Field::new(0, 4);
    pub const FMASK_TILE_MODE_INDEX: Field = Field::new(5, 9);
    pub const FMASK_BANK_HEIGHT: Field = Field::new(10, 11);
    pub const NUM_SAMPLES: Field = Field::new(12, 14);
    pub const NUM_FRAGMENTS_GFX6: Field = Field::new(15, 16);
    pub const FORCE_DST_ALPHA_1_GFX6: Field = Field::bit(17);

    // GFX9
    pub const MIP0_DEPTH: Field = Field::new(0, 10);
    pub const COLOR_SW_MODE: Field = Field::new(18, 22);
    pub const FMASK_SW_MODE: Field = Field::new(23, 27);
    pub const RESOURCE_TYPE: Field = Field::new(28, 29);
    pub const RB_ALIGNED: Field = Field::bit(30);
    pub const PIPE_ALIGNED: Field = Field::bit(31);

    // GFX11
    pub const NUM_FRAGMENTS_GFX11: Field = Field::new(12, 13);
    pub const FORCE_DST_ALPHA_1_GFX11: Field = Field::bit(14);
}

/// CB_COLOR0_VIEW
pub mod cb_color_view {
    use super::Field;

    pub const SLICE_START: Field = Field::new(0, 12);
    pub const SLICE_MAX_GFX6: Field = Field::new(13, 23);
    pub const SLICE_MAX_GFX10: Field = Field::new(13, 25);
    pub const MIP_LEVEL_GFX9: Field = Field::new(24, 27);
    pub const MIP_LEVEL_GFX10: Field = Field::new(26, 29);
}

/// CB_COLOR0_ATTRIB2 (GFX9+)
pub mod cb_color_attrib2 {
    use super::Field;

    pub const MIP0_HEIGHT: Field = Field::new(0, 13);
    pub const MIP0_WIDTH: Field = Field::new(14, 27);
    pub const MAX_MIP: Field = Field::new(28, 31);
}

/// CB_COLOR0_ATTRIB3 (GFX10+)
pub mod cb_color_attrib3 {
    use super::Field;

    pub const MIP0_DEPTH: Field = Field::new(0, 12);
    pub const COLOR_SW_MODE: Field = Field::new(14, 18);
    pub const FMASK_SW_MODE: Field = Field::new(19, 23);
    pub const RESOURCE_TYPE: Field = Field::new(24, 25);
    pub const CMASK_PIPE_ALIGNED: Field = Field::bit(26);
    pub const RESOURCE_LEVEL: Field = Field::new(27, 29);
    pub const DCC_PIPE_ALIGNED: Field = Field::bit(30);
}

/// CB_COLOR0_PITCH (GFX6-8)
pub mod cb_color_pitch {
    use super::Field;

    pub const TILE_MAX: Field = Field::new(0, 10);
    pub const FMASK_TILE_MAX: Field = Field::new(20, 30);
}

/// CB_COLOR0_SLICE / CB_COLOR0_FMASK_SLICE (GFX6-8)
pub mod cb_color_slice {
    use super::Field;

    pub const TILE_MAX: Field = Field::new(0, 21);
}

/// CB_MRT0_EPITCH (GFX9)
pub mod cb_mrt_epitch {
    use super::Field;

    pub const EPITCH: Field = Field::new(0, 15);
}

/// CB_COLOR0_DCC_CONTROL
pub mod cb_dcc_control {
    use super::Field;

    pub const MAX_UNCOMPRESSED_BLOCK_SIZE: Field = Field::new(2, 3);
    pub const MIN_COMPRESSED_BLOCK_SIZE: Field = Field::bit(4);
    pub const MAX_COMPRESSED_BLOCK_SIZE: Field = Field::new(5, 6);
    pub const INDEPENDENT_64B_BLOCKS: Field = Field::bit(9);
    pub const INDEPENDENT_128B_BLOCKS_GFX11: Field = Field::bit(10);
    pub const DISABLE_CONSTANT_ENCODE_REG: Field = Field::bit(18);
    pub const INDEPENDENT_128B_BLOCKS_GFX10: Field = Field::bit(20);
    pub const FDCC_ENABLE: Field = Field::bit(22);
    pub const ENABLE_MAX_COMP_FRAG_OVERRIDE: Field = Field::bit(24);
    pub const MAX_COMP_FRAGS: Field = Field::new(25, 27);

    pub const MAX_BLOCK_SIZE_64B: u32 = 0;
    pub const MAX_BLOCK_SIZE_128B: u32 = 1;
    pub const MAX_BLOCK_SIZE_256B: u32 = 2;
    pub const MIN_BLOCK_SIZE_32B: u32 = 0;
    pub const MIN_BLOCK_SIZE_64B: u32 = 1;
}

// =============================================================================
// DEPTH BUFFER
// =============================================================================

/// DB_DEPTH_VIEW
pub mod db_depth_view {
    use super::Field;

    pub const SLICE_START: Field = Field::new(0, 10);
    pub const SLICE_START_HI: Field = Field::new(11, 12);
    pub const SLICE_MAX: Field = Field::new(13, 23);
    pub const Z_READ_ONLY: Field = Field::bit(24);
    pub const STENCIL_READ_ONLY: Field = Field::bit(25);
    pub const MIPID: Field = Field::new(26, 29);
    pub const SLICE_MAX_HI: Field = Field::new(30, 31);
}

/// DB_RENDER_OVERRIDE2
pub mod db_render_override2 {
    use super::Field;

    pub const DECOMPRESS_Z_ON_FLUSH: Field = Field::bit(28);
    pub const CENTROID_COMPUTATION_MODE: Field = Field::new(29, 30);
}

/// DB_RENDER_CONTROL
pub mod db_render_control {
    use super::Field;

    pub const MAX_ALLOWED_TILES_IN_WAVE: Field = Field::new(20, 23);
}

/// DB_Z_INFO (GFX9+)
pub mod db_z_info {
    use super::Field;

    pub const FORMAT: Field = Field::new(0, 1);
    pub const NUM_SAMPLES: Field = Field::new(2, 3);
    pub const SW_MODE: Field = Field::new(4, 8);
    pub const ITERATE_FLUSH: Field = Field::bit(11);
    pub const ITERATE_FLUSH_GFX9: Field = Field::bit(15);
    pub const MAXMIP: Field = Field::new(16, 19);
    pub const ITERATE_256: Field = Field::bit(20);
    pub const DECOMPRESS_ON_N_ZPLANES: Field = Field::new(23, 26);
    pub const TILE_SURFACE_ENABLE: Field = Field::bit(29);
    pub const ZRANGE_PRECISION: Field = Field::bit(31);
}

/// DB_STENCIL_INFO (GFX9+)
pub mod db_stencil_info {
    use super::Field;

    pub const FORMAT: Field = Field::bit(0);
    pub const SW_MODE: Field = Field::new(4, 8);
    pub const ITERATE_FLUSH: Field = Field::bit(11);
    pub const ITERATE_FLUSH_GFX9: Field = Field::bit(15);
    pub const ITERATE_256: Field = Field::bit(20);
    pub const TILE_STENCIL_DISABLE: Field = Field::bit(29);
}

/// DB_Z_INFO2 / DB_STENCIL_INFO2 (GFX9)
pub mod db_info2 {
    use super::Field;

    pub const EPITCH: Field = Field::new(0, 15);
}

/// DB_DEPTH_SIZE (GFX9+)
pub mod db_depth_size {
    use super::Field;

    pub const X_MAX: Field = Field::new(0, 13);
    pub const Y_MAX: Field = Field::new(16, 29);
}

/// DB_Z_INFO (GFX6-8)
pub mod db_z_info_legacy {
    use super::Field;

    pub const FORMAT: Field = Field::new(0, 1);
    pub const NUM_SAMPLES: Field = Field::new(2, 3);
    pub const TILE_SPLIT: Field = Field::new(13, 15);
    pub const TILE_MODE_INDEX: Field = Field::new(20, 22);
    pub const DECOMPRESS_ON_N_ZPLANES: Field = Field::new(23, 26);
    pub const TILE_SURFACE_ENABLE: Field = Field::bit(29);
    pub const ZRANGE_PRECISION: Field = Field::bit(31);
}

/// DB_STENCIL_INFO (GFX6-8)
pub mod db_stencil_info_legacy {
    use super::Field;

    pub const FORMAT: Field = Field::bit(0);
    pub const TILE_SPLIT: Field = Field::new(13, 15);
    pub const TILE_MODE_INDEX: Field = Field::new(20, 22);
    pub const TILE_STENCIL_DISABLE: Field = Field::bit(29);
}

/// DB_DEPTH_INFO (GFX6-8)
pub mod db_depth_info {
    use super::Field;

    pub const ADDR5_SWIZZLE_MASK: Field = Field::bit(0);
    pub const ARRAY_MODE: Field = Field::new(4, 7);
    pub const PIPE_CONFIG: Field = Field::new(8, 12);
    pub const BANK_WIDTH: Field = Field::new(13, 14);
    pub const BANK_HEIGHT: Field = Field::new(15, 16);
    pub const MACRO_TILE_ASPECT: Field = Field::new(17, 18);
    pub const NUM_BANKS: Field = Field::new(19, 20);
}

/// DB_DEPTH_SIZE / DB_DEPTH_SLICE (GFX6-8)
pub mod db_depth_size_legacy {
    use super::Field;

    pub const PITCH_TILE_MAX: Field = Field::new(0, 10);
    pub const HEIGHT_TILE_MAX: Field = Field::new(11, 21);
    pub const SLICE_TILE_MAX: Field = Field::new(0, 21);
}

/// DB_HTILE_SURFACE
pub mod db_htile_surface {
    use super::Field;

    pub const FULL_CACHE: Field = Field::bit(1);
    pub const TC_COMPATIBLE: Field = Field::bit(17);
    pub const RB_ALIGNED: Field = Field::bit(18);
    pub const PIPE_ALIGNED: Field = Field::bit(19);
    pub const VRS_HTILE_ENCODING: Field = Field::new(20, 21);

    pub const VRS_HTILE_4BIT_ENCODING: u32 = 2;
}

/// Depth format encodings
pub mod z_format {
    pub const INVALID: u32 = 0;
    pub const Z_16: u32 = 1;
    pub const Z_24: u32 = 2;
    pub const Z_32_FLOAT: u32 = 3;
}

/// Stencil format encodings
pub mod stencil_format {
    pub const INVALID: u32 = 0;
    pub const STENCIL_8: u32 = 1;
}

// =============================================================================
// TILING TABLES (GFX6-8)
// =============================================================================

/// GB_TILE_MODE*
pub mod gb_tile_mode {
    use super::Field;

    pub const ARRAY_MODE: Field = Field::new(2, 5);
    pub const PIPE_CONFIG: Field = Field::new(6, 10);
    pub const TILE_SPLIT: Field = Field::new(11, 13);
}

/// GB_MACROTILE_MODE*
pub mod gb_macrotile_mode {
    use super::Field;

    pub const BANK_WIDTH: Field = Field::new(0, 1);
    pub const BANK_HEIGHT: Field = Field::new(2, 3);
    pub const MACRO_TILE_ASPECT: Field = Field::new(4, 5);
    pub const NUM_BANKS: Field = Field::new(6, 7);
}

// =============================================================================
// MSAA STATE
// =============================================================================

/// Context register offsets for sample positions
pub mod pa_sc {
    pub const CENTROID_PRIORITY_0: u32 = 0x028BD4;
    pub const CENTROID_PRIORITY_1: u32 = 0x028BD8;
    pub const AA_SAMPLE_LOCS_PIXEL_X0Y0_0: u32 = 0x028BF8;
    pub const AA_SAMPLE_LOCS_PIXEL_X1Y0_0: u32 = 0x028C08;
    pub const AA_SAMPLE_LOCS_PIXEL_X0Y1_0: u32 = 0x028C18;
    pub const AA_SAMPLE_LOCS_PIXEL_X1Y1_0: u32 = 0x028C28;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_round_trip() {
        let f = Field::new(13, 25);
        assert_eq!(f.mask(), 0x03FF_E000);
        assert_eq!(f.get(f.set(0x1FFF)), 0x1FFF);
        assert_eq!(f.set(0x2000), 0);
    }

    #[test]
    fn test_top_bit_field() {
        assert_eq!(db_z_info::ZRANGE_PRECISION.set(1), 0x8000_0000);
        assert_eq!(cb_color_attrib2::MAX_MIP.mask(), 0xF000_0000);
        assert_eq!(Field::new(0, 31).mask(), u32::MAX);
    }

    #[test]
    fn test_flag() {
        assert_eq!(cb_color_info::SIMPLE_FLOAT.flag(true), 1 << 17);
        assert_eq!(cb_color_info::SIMPLE_FLOAT.flag(false), 0);
    }
}
