//! # Color Surface Encoding
//!
//! Builds the CB_COLOR* register block for an image view bound as a color
//! attachment.
//!
//! ```text
//!            ┌──────────────┐
//!  Image ───►│              │──► base / cmask / fmask / dcc addresses
//!  View  ───►│   encoder    │──► pitch, slice, view (layers, mip)
//!  Chip  ───►│              │──► info (format, swap, compression)
//!            └──────────────┘──► attrib / attrib2 / attrib3 / dcc control
//! ```
//!
//! Legacy surfaces describe tiling through tile mode indices and tile
//! counts; unified surfaces carry a swizzle mode and mip0 extents. GFX11
//! moves the format and fragment fields and drops the DCC enable bit.

use ember_core::{ChipInfo, GfxLevel};

use crate::EncodeOptions;
use crate::format::{color_format, colorformat_endian_swap, number_type};
use crate::image::{Image, ImageType, ImageView, SurfMode, SurfaceLayout};
use crate::regs::{
    cb_color_attrib, cb_color_attrib2, cb_color_attrib3, cb_color_info, cb_color_pitch,
    cb_color_slice, cb_color_view, cb_dcc_control, cb_mrt_epitch,
};

/// Register state of one color attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ColorSurfaceDescriptor {
    /// CB_COLOR_BASE (address >> 8, with swizzle)
    pub cb_color_base: u64,
    /// CB_COLOR_CMASK (address >> 8)
    pub cb_color_cmask: u64,
    /// CB_COLOR_FMASK (address >> 8, with swizzle)
    pub cb_color_fmask: u64,
    /// CB_COLOR_DCC_BASE (address >> 8, with swizzle)
    pub cb_dcc_base: u64,
    /// CB_COLOR_PITCH
    pub cb_color_pitch: u32,
    /// CB_COLOR_SLICE
    pub cb_color_slice: u32,
    /// CB_COLOR_VIEW
    pub cb_color_view: u32,
    /// CB_COLOR_INFO
    pub cb_color_info: u32,
    /// CB_COLOR_ATTRIB
    pub cb_color_attrib: u32,
    /// CB_COLOR_ATTRIB2
    pub cb_color_attrib2: u32,
    /// CB_COLOR_ATTRIB3
    pub cb_color_attrib3: u32,
    /// CB_COLOR_DCC_CONTROL
    pub cb_dcc_control: u32,
    /// CB_COLOR_CMASK_SLICE
    pub cb_color_cmask_slice: u32,
    /// CB_COLOR_FMASK_SLICE
    pub cb_color_fmask_slice: u32,
    /// CB_MRT_EPITCH
    pub cb_mrt_epitch: u32,
}

// =============================================================================
// DCC CONTROL
// =============================================================================

/// Largest uncompressed block DCC may produce
pub fn dcc_max_uncompressed_block_size(chip: &ChipInfo, image: &Image) -> u32 {
    if chip.gfx_level < GfxLevel::Gfx10 && image.samples > 1 {
        match image.surface.bpe {
            1 => return cb_dcc_control::MAX_BLOCK_SIZE_64B,
            2 => return cb_dcc_control::MAX_BLOCK_SIZE_128B,
            _ => {}
        }
    }
    cb_dcc_control::MAX_BLOCK_SIZE_256B
}

/// Smallest compressed block; APU memory has a 64-byte request granularity
pub fn dcc_min_compressed_block_size(chip: &ChipInfo) -> u32 {
    if chip.has_dedicated_vram {
        cb_dcc_control::MIN_BLOCK_SIZE_32B
    } else {
        cb_dcc_control::MIN_BLOCK_SIZE_64B
    }
}

/// CB_DCC_CONTROL for a view, zero when the view's level has no DCC
pub fn dcc_control(chip: &ChipInfo, image: &Image, view: &ImageView) -> u32 {
    use crate::image::ImageUsage;

    let level = view.base_mip_level;
    if !image.dcc_enabled(level) {
        return 0;
    }

    let max_uncompressed = dcc_max_uncompressed_block_size(chip, image);
    let min_compressed = dcc_min_compressed_block_size(chip);

    let (max_compressed, independent_64b, independent_128b) = match &image.surface.layout {
        SurfaceLayout::Unified(u) => (
            u.dcc.max_compressed_block_size,
            u.dcc.independent_64b_blocks,
            u.dcc.independent_128b_blocks,
        ),
        SurfaceLayout::Legacy(_) => {
            let texture_read = image.usage.intersects(
                ImageUsage::SAMPLED | ImageUsage::TRANSFER_SRC | ImageUsage::INPUT_ATTACHMENT,
            );
            if texture_read {
                (cb_dcc_control::MAX_BLOCK_SIZE_64B, true, false)
            } else {
                // MAX_UNCOMPRESSED must be >= MAX_COMPRESSED.
                (max_uncompressed, false, false)
            }
        }
    };

    let mut value = cb_dcc_control::MAX_UNCOMPRESSED_BLOCK_SIZE.set(max_uncompressed)
        | cb_dcc_control::MAX_COMPRESSED_BLOCK_SIZE.set(max_compressed)
        | cb_dcc_control::MIN_COMPRESSED_BLOCK_SIZE.set(min_compressed)
        | cb_dcc_control::INDEPENDENT_64B_BLOCKS.flag(independent_64b);

    if chip.gfx_level >= GfxLevel::Gfx11 {
        value |= cb_dcc_control::INDEPENDENT_128B_BLOCKS_GFX11.flag(independent_128b)
            | cb_dcc_control::DISABLE_CONSTANT_ENCODE_REG.flag(true)
            | cb_dcc_control::FDCC_ENABLE.flag(true);

        if chip.family >= ember_core::ChipFamily::Gfx1103R2 {
            value |= cb_dcc_control::ENABLE_MAX_COMP_FRAG_OVERRIDE.flag(true)
                | cb_dcc_control::MAX_COMP_FRAGS.flag(image.samples >= 4);
        }
    } else {
        value |= cb_dcc_control::INDEPENDENT_128B_BLOCKS_GFX10.flag(independent_128b);
    }

    value
}

// =============================================================================
// ENCODER
// =============================================================================

/// Encode the color attachment registers of `view`
pub fn encode_color_surface(
    chip: &ChipInfo,
    image: &Image,
    view: &ImageView,
    options: EncodeOptions,
) -> ColorSurfaceDescriptor {
    let gfx = chip.gfx_level;
    let surf = &image.surface;
    let level = view.base_mip_level;
    let mut cb = ColorSurfaceDescriptor::default();

    debug_assert_eq!(
        matches!(surf.layout, SurfaceLayout::Legacy(_)),
        gfx < GfxLevel::Gfx9,
        "surface layout does not match the chip generation"
    );

    // Intensity is stored as red, so alpha-less formats force alpha to 1.
    cb.cb_color_attrib = if gfx >= GfxLevel::Gfx11 {
        cb_color_attrib::FORCE_DST_ALPHA_1_GFX11.flag(view.format.alpha_is_one())
    } else {
        cb_color_attrib::FORCE_DST_ALPHA_1_GFX6.flag(view.format.alpha_is_one())
    };

    let mut va = image.va.raw();
    let mut tile_swizzle = surf.tile_swizzle;
    if let Some(nbc) = view.nbc_view {
        va += nbc.base_address_offset;
        tile_swizzle = nbc.tile_swizzle;
    }
    cb.cb_color_base = va >> 8;

    match &surf.layout {
        SurfaceLayout::Unified(u) => {
            if gfx >= GfxLevel::Gfx11 {
                cb.cb_color_attrib3 |= cb_color_attrib3::COLOR_SW_MODE.set(u.swizzle_mode)
                    | cb_color_attrib3::DCC_PIPE_ALIGNED.flag(u.dcc.pipe_aligned);
            } else if gfx >= GfxLevel::Gfx10 {
                cb.cb_color_attrib3 |= cb_color_attrib3::COLOR_SW_MODE.set(u.swizzle_mode)
                    | cb_color_attrib3::FMASK_SW_MODE.set(u.fmask_swizzle_mode)
                    | cb_color_attrib3::CMASK_PIPE_ALIGNED.flag(true)
                    | cb_color_attrib3::DCC_PIPE_ALIGNED.flag(u.dcc.pipe_aligned);
            } else {
                let (rb_aligned, pipe_aligned) = if surf.meta_offset != 0 {
                    (u.dcc.rb_aligned, u.dcc.pipe_aligned)
                } else {
                    (true, true)
                };
                cb.cb_color_attrib |= cb_color_attrib::COLOR_SW_MODE.set(u.swizzle_mode)
                    | cb_color_attrib::FMASK_SW_MODE.set(u.fmask_swizzle_mode)
                    | cb_color_attrib::RB_ALIGNED.flag(rb_aligned)
                    | cb_color_attrib::PIPE_ALIGNED.flag(pipe_aligned);
                cb.cb_mrt_epitch = cb_mrt_epitch::EPITCH.set(u.epitch);
            }

            cb.cb_color_base += u.surf_offset >> 8;
            cb.cb_color_base |= u64::from(tile_swizzle);
        }
        SurfaceLayout::Legacy(l) => {
            let info = l.levels.get(level as usize).copied().unwrap_or_default();

            cb.cb_color_base += u64::from(info.offset_256b);
            if info.mode == SurfMode::Tiled2d {
                cb.cb_color_base |= u64::from(tile_swizzle);
            }

            let pitch_tile_max = (info.nblk_x / 8).saturating_sub(1);
            let slice_tile_max = (info.nblk_x * info.nblk_y / 64).saturating_sub(1);
            let tile_mode_index = image.tile_mode_index(level, false);

            cb.cb_color_pitch = cb_color_pitch::TILE_MAX.set(pitch_tile_max);
            cb.cb_color_slice = cb_color_slice::TILE_MAX.set(slice_tile_max);
            cb.cb_color_cmask_slice = l.cmask_slice_tile_max;
            cb.cb_color_attrib |= cb_color_attrib::TILE_MODE_INDEX.set(tile_mode_index);

            if image.meta.has_fmask {
                if gfx >= GfxLevel::Gfx7 {
                    cb.cb_color_pitch |= cb_color_pitch::FMASK_TILE_MAX
                        .set((l.fmask.pitch_in_pixels / 8).saturating_sub(1));
                }
                cb.cb_color_attrib |=
                    cb_color_attrib::FMASK_TILE_MODE_INDEX.set(l.fmask.tiling_index);
                cb.cb_color_fmask_slice = cb_color_slice::TILE_MAX.set(l.fmask.slice_tile_max);
            } else {
                // Fast clears without FMASK still read these.
                if gfx >= GfxLevel::Gfx7 {
                    cb.cb_color_pitch |= cb_color_pitch::FMASK_TILE_MAX.set(pitch_tile_max);
                }
                cb.cb_color_attrib |= cb_color_attrib::FMASK_TILE_MODE_INDEX.set(tile_mode_index);
                cb.cb_color_fmask_slice = cb_color_slice::TILE_MAX.set(slice_tile_max);
            }
        }
    }

    // Metadata addresses are relative to the image binding, not the nbc view.
    let base = image.va.raw();
    cb.cb_color_cmask = (base + surf.cmask_offset) >> 8;

    let mut dcc_va = base + surf.meta_offset;
    if let SurfaceLayout::Legacy(l) = &surf.layout {
        if image.dcc_enabled(level) {
            dcc_va += l.levels.get(level as usize).map_or(0, |lvl| lvl.dcc_offset);
        }
    }
    let meta_align_mask = 1u64
        .checked_shl(surf.meta_alignment_log2)
        .map_or(u64::MAX, |align| align - 1)
        >> 8;
    cb.cb_dcc_base = (dcc_va >> 8) | (u64::from(tile_swizzle) & meta_align_mask);

    let max_slice = view.max_layer_count().saturating_sub(1);
    let slice_start = if view.nbc_view.is_some() {
        0
    } else {
        view.base_array_layer
    };
    cb.cb_color_view =
        cb_color_view::SLICE_START.set(slice_start) | cb_color_view::SLICE_MAX_GFX10.set(max_slice);

    if image.samples > 1 {
        let log_samples = image.samples.ilog2();
        if gfx >= GfxLevel::Gfx11 {
            cb.cb_color_attrib |= cb_color_attrib::NUM_FRAGMENTS_GFX11.set(log_samples);
        } else {
            cb.cb_color_attrib |= cb_color_attrib::NUM_SAMPLES.set(log_samples)
                | cb_color_attrib::NUM_FRAGMENTS_GFX6.set(log_samples);
        }
    }

    cb.cb_color_fmask = if image.meta.has_fmask {
        ((base + surf.fmask_offset) >> 8) | u64::from(surf.fmask_tile_swizzle)
    } else {
        cb.cb_color_base
    };

    let ntype = view.format.cb_number_type();
    let format = view.format.cb_format(gfx);
    debug_assert_ne!(format, color_format::INVALID, "{:?} is not renderable", view.format);
    let swap = view.format.color_swap();
    let endian = colorformat_endian_swap(format);

    let normalized = matches!(
        ntype,
        number_type::UNORM | number_type::SNORM | number_type::SRGB
    );
    let packed_depth = matches!(
        format,
        color_format::C_8_24 | color_format::C_24_8 | color_format::C_X24_8_32_FLOAT
    );
    let integer = matches!(ntype, number_type::UINT | number_type::SINT);
    let blend_bypass = integer || packed_depth;
    let blend_clamp = normalized && !blend_bypass;
    let round_mode = !normalized
        && format != color_format::C_8_24
        && format != color_format::C_24_8;

    cb.cb_color_info = cb_color_info::COMP_SWAP.set(swap)
        | cb_color_info::BLEND_CLAMP.flag(blend_clamp)
        | cb_color_info::BLEND_BYPASS.flag(blend_bypass)
        | cb_color_info::SIMPLE_FLOAT.flag(true)
        | cb_color_info::ROUND_MODE.flag(round_mode)
        | cb_color_info::NUMBER_TYPE.set(ntype);

    if gfx >= GfxLevel::Gfx11 {
        cb.cb_color_info |= cb_color_info::FORMAT_GFX11.set(format);
    } else {
        cb.cb_color_info |= cb_color_info::FORMAT_GFX6.set(format) | cb_color_info::ENDIAN.set(endian);
    }

    if image.meta.has_fmask {
        cb.cb_color_info |= cb_color_info::COMPRESSION.flag(true);
        if gfx == GfxLevel::Gfx6 {
            if let SurfaceLayout::Legacy(l) = &surf.layout {
                cb.cb_color_attrib |=
                    cb_color_attrib::FMASK_BANK_HEIGHT.set(l.fmask.bankh.max(1).ilog2());
            }
        }

        if image.meta.tc_compat_cmask {
            cb.cb_color_info |= cb_color_info::FMASK_COMPRESS_1FRAG_ONLY.flag(true);
            if gfx == GfxLevel::Gfx8 {
                // CMASK tiling readable by the texture block.
                cb.cb_color_info |= cb_color_info::CMASK_ADDR_TYPE.set(2);
            }
        }
    }

    if image.meta.has_cmask && options.fast_clears {
        cb.cb_color_info |= cb_color_info::FAST_CLEAR.flag(true);
    }

    if image.dcc_enabled(level) && !view.disable_dcc_mrt && gfx < GfxLevel::Gfx11 {
        cb.cb_color_info |= cb_color_info::DCC_ENABLE.flag(true);
    }

    cb.cb_dcc_control = dcc_control(chip, image, view);

    if !image.meta.has_fmask && gfx == GfxLevel::Gfx6 {
        if let SurfaceLayout::Legacy(l) = &surf.layout {
            cb.cb_color_attrib |= cb_color_attrib::FMASK_BANK_HEIGHT.set(l.bankh.max(1).ilog2());
        }
    }

    if let SurfaceLayout::Unified(u) = &surf.layout {
        let mip0_depth = if image.image_type == ImageType::D3 {
            view.extent.depth.saturating_sub(1)
        } else {
            image.array_layers.saturating_sub(1)
        };
        let mut width = view.extent.width;
        let height = view.extent.height;
        let mut max_mip = image.mip_levels.saturating_sub(1);

        if gfx >= GfxLevel::Gfx10 {
            let mut base_level = level;
            if let Some(nbc) = view.nbc_view {
                base_level = nbc.level;
                max_mip = nbc.num_levels.saturating_sub(1);
            }

            cb.cb_color_view |= cb_color_view::MIP_LEVEL_GFX10.set(base_level);
            cb.cb_color_attrib3 |= cb_color_attrib3::MIP0_DEPTH.set(mip0_depth)
                | cb_color_attrib3::RESOURCE_TYPE.set(u.resource_type)
                | cb_color_attrib3::RESOURCE_LEVEL.set(u32::from(gfx < GfxLevel::Gfx11));
        } else {
            cb.cb_color_view |= cb_color_view::MIP_LEVEL_GFX9.set(level);
            cb.cb_color_attrib |= cb_color_attrib::MIP0_DEPTH.set(mip0_depth)
                | cb_color_attrib::RESOURCE_TYPE.set(u.resource_type);
        }

        // 2D linear non-array surfaces carry their real pitch in MIP0_WIDTH.
        if gfx >= GfxLevel::Gfx10_3
            && image.image_type == ImageType::D2
            && image.array_layers == 1
            && surf.is_linear
        {
            debug_assert_eq!((u.surf_pitch * surf.bpe) % 256, 0);
            width = u.surf_pitch;
            if surf.blk_w == 2 {
                width *= 2;
            }
        }

        cb.cb_color_attrib2 = cb_color_attrib2::MIP0_WIDTH.set(width.saturating_sub(1))
            | cb_color_attrib2::MIP0_HEIGHT.set(height.saturating_sub(1))
            | cb_color_attrib2::MAX_MIP.set(max_mip);
    }

    cb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, swap};
    use crate::image::{Extent3d, LegacyLayout, LegacyLevel, Surface, UnifiedLayout};
    use ember_core::{ChipFamily, GpuAddr};

    fn unified_image(format: Format) -> Image {
        let layout = UnifiedLayout {
            swizzle_mode: 27,
            epitch: 255,
            resource_type: 1,
            ..UnifiedLayout::default()
        };
        let mut image = Image::new_2d(format, Extent3d::new_2d(256, 128), Surface::unified(4, layout));
        image.va = GpuAddr::new(0x1_2345_6700);
        image
    }

    fn legacy_image() -> Image {
        let mut layout = LegacyLayout::default();
        layout.levels.push(LegacyLevel {
            offset_256b: 0x10,
            nblk_x: 64,
            nblk_y: 32,
            mode: SurfMode::Tiled2d,
            dcc_offset: 0,
            slice_size_dw: 0,
        });
        layout.tiling_index[0] = 14;
        let mut surface = Surface::legacy(4, layout);
        surface.tile_swizzle = 0x3;
        let mut image = Image::new_2d(Format::R8G8B8A8Unorm, Extent3d::new_2d(64, 32), surface);
        image.va = GpuAddr::new(0x40_0000);
        image
    }

    #[test]
    fn test_gfx10_3_rgba8() {
        let chip = ChipInfo::for_family(ChipFamily::Navi21);
        let image = unified_image(Format::R8G8B8A8Unorm);
        let cb = encode_color_surface(&chip, &image, &ImageView::of(&image), EncodeOptions::default());

        assert_eq!(cb.cb_color_base, 0x1_2345_6700 >> 8);
        assert_eq!(
            cb_color_info::FORMAT_GFX6.get(cb.cb_color_info),
            color_format::C_8_8_8_8
        );
        assert_eq!(cb_color_info::NUMBER_TYPE.get(cb.cb_color_info), number_type::UNORM);
        assert_eq!(cb_color_info::BLEND_CLAMP.get(cb.cb_color_info), 1);
        assert_eq!(cb_color_info::ROUND_MODE.get(cb.cb_color_info), 0);
        assert_eq!(cb_color_attrib3::COLOR_SW_MODE.get(cb.cb_color_attrib3), 27);
        assert_eq!(cb_color_attrib3::RESOURCE_LEVEL.get(cb.cb_color_attrib3), 1);
        assert_eq!(cb_color_attrib2::MIP0_WIDTH.get(cb.cb_color_attrib2), 255);
        assert_eq!(cb_color_attrib2::MIP0_HEIGHT.get(cb.cb_color_attrib2), 127);
        assert_eq!(cb.cb_color_fmask, cb.cb_color_base);
        assert_eq!(cb.cb_dcc_control, 0);
    }

    #[test]
    fn test_gfx9_epitch_and_alignment() {
        let chip = ChipInfo::for_family(ChipFamily::Vega10);
        let image = unified_image(Format::B8G8R8A8Srgb);
        let cb = encode_color_surface(&chip, &image, &ImageView::of(&image), EncodeOptions::default());

        assert_eq!(cb.cb_mrt_epitch, 255);
        assert_eq!(cb_color_attrib::RB_ALIGNED.get(cb.cb_color_attrib), 1);
        assert_eq!(cb_color_attrib::PIPE_ALIGNED.get(cb.cb_color_attrib), 1);
        assert_eq!(cb_color_info::COMP_SWAP.get(cb.cb_color_info), swap::ALT);
        assert_eq!(cb_color_info::NUMBER_TYPE.get(cb.cb_color_info), number_type::SRGB);
        assert_eq!(cb.cb_color_attrib3, 0);
    }

    #[test]
    fn test_oversized_meta_alignment_keeps_whole_swizzle() {
        let chip = ChipInfo::for_family(ChipFamily::Navi21);
        let mut image = unified_image(Format::R8G8B8A8Unorm);
        image.surface.meta_alignment_log2 = 64;
        image.surface.tile_swizzle = 0x18;
        let cb = encode_color_surface(&chip, &image, &ImageView::of(&image), EncodeOptions::default());
        let dcc_base = (image.va.raw() + image.surface.meta_offset) >> 8;
        assert_eq!(cb.cb_dcc_base, dcc_base | 0x18);
    }

    #[test]
    fn test_gfx11_moves_fields_and_drops_dcc_enable() {
        let chip = ChipInfo::for_family(ChipFamily::Navi31);
        let mut image = unified_image(Format::R16G16B16A16Sfloat);
        image.samples = 4;
        image.meta.dcc_levels = 1;
        let cb = encode_color_surface(&chip, &image, &ImageView::of(&image), EncodeOptions::default());

        assert_eq!(
            cb_color_info::FORMAT_GFX11.get(cb.cb_color_info),
            color_format::C_16_16_16_16
        );
        assert_eq!(cb_color_attrib::NUM_FRAGMENTS_GFX11.get(cb.cb_color_attrib), 2);
        assert_eq!(cb_color_info::DCC_ENABLE.get(cb.cb_color_info), 0);
        assert_eq!(cb_dcc_control::FDCC_ENABLE.get(cb.cb_dcc_control), 1);
        assert_eq!(cb_color_attrib3::RESOURCE_LEVEL.get(cb.cb_color_attrib3), 0);
        assert_eq!(cb_color_info::ROUND_MODE.get(cb.cb_color_info), 1);
    }

    #[test]
    fn test_gfx10_dcc_enable_honors_disable_mrt() {
        let chip = ChipInfo::for_family(ChipFamily::Navi10);
        let mut image = unified_image(Format::R8G8B8A8Unorm);
        image.meta.dcc_levels = 1;
        let mut view = ImageView::of(&image);
        let cb = encode_color_surface(&chip, &image, &view, EncodeOptions::default());
        assert_eq!(cb_color_info::DCC_ENABLE.get(cb.cb_color_info), 1);

        view.disable_dcc_mrt = true;
        let cb = encode_color_surface(&chip, &image, &view, EncodeOptions::default());
        assert_eq!(cb_color_info::DCC_ENABLE.get(cb.cb_color_info), 0);
    }

    #[test]
    fn test_integer_formats_bypass_blending() {
        let chip = ChipInfo::for_family(ChipFamily::Navi21);
        let image = unified_image(Format::R32Uint);
        let cb = encode_color_surface(&chip, &image, &ImageView::of(&image), EncodeOptions::default());
        assert_eq!(cb_color_info::BLEND_BYPASS.get(cb.cb_color_info), 1);
        assert_eq!(cb_color_info::BLEND_CLAMP.get(cb.cb_color_info), 0);
        assert_eq!(cb_color_info::ROUND_MODE.get(cb.cb_color_info), 1);
    }

    #[test]
    fn test_fast_clear_follows_options() {
        let chip = ChipInfo::for_family(ChipFamily::Navi21);
        let mut image = unified_image(Format::R8G8B8A8Unorm);
        image.meta.has_cmask = true;
        let view = ImageView::of(&image);

        let cb = encode_color_surface(&chip, &image, &view, EncodeOptions::default());
        assert_eq!(cb_color_info::FAST_CLEAR.get(cb.cb_color_info), 1);

        let cb = encode_color_surface(&chip, &image, &view, EncodeOptions { fast_clears: false });
        assert_eq!(cb_color_info::FAST_CLEAR.get(cb.cb_color_info), 0);
    }

    #[test]
    fn test_legacy_tiling() {
        let chip = ChipInfo::for_family(ChipFamily::Polaris10);
        let image = legacy_image();
        let cb = encode_color_surface(&chip, &image, &ImageView::of(&image), EncodeOptions::default());

        assert_eq!(cb.cb_color_base, ((0x40_0000 >> 8) + 0x10) | 0x3);
        assert_eq!(cb_color_pitch::TILE_MAX.get(cb.cb_color_pitch), 7);
        assert_eq!(cb_color_pitch::FMASK_TILE_MAX.get(cb.cb_color_pitch), 7);
        assert_eq!(cb_color_slice::TILE_MAX.get(cb.cb_color_slice), 31);
        assert_eq!(cb.cb_color_fmask_slice, cb.cb_color_slice);
        assert_eq!(cb_color_attrib::TILE_MODE_INDEX.get(cb.cb_color_attrib), 14);
        assert_eq!(cb_color_attrib::FMASK_TILE_MODE_INDEX.get(cb.cb_color_attrib), 14);
        assert_eq!(cb.cb_color_attrib2, 0);
    }

    #[test]
    fn test_legacy_1d_tiling_skips_swizzle() {
        let chip = ChipInfo::for_family(ChipFamily::Polaris10);
        let mut image = legacy_image();
        if let SurfaceLayout::Legacy(l) = &mut image.surface.layout {
            l.levels[0].mode = SurfMode::Tiled1d;
        }
        let cb = encode_color_surface(&chip, &image, &ImageView::of(&image), EncodeOptions::default());
        assert_eq!(cb.cb_color_base, (0x40_0000 >> 8) + 0x10);
    }

    #[test]
    fn test_legacy_msaa_sets_samples_and_fragments() {
        let chip = ChipInfo::for_family(ChipFamily::Hawaii);
        let mut image = legacy_image();
        image.samples = 8;
        let cb = encode_color_surface(&chip, &image, &ImageView::of(&image), EncodeOptions::default());
        assert_eq!(cb_color_attrib::NUM_SAMPLES.get(cb.cb_color_attrib), 3);
        assert_eq!(cb_color_attrib::NUM_FRAGMENTS_GFX6.get(cb.cb_color_attrib), 3);
    }

    #[test]
    fn test_alpha_less_format_forces_alpha() {
        let chip = ChipInfo::for_family(ChipFamily::Navi21);
        let image = unified_image(Format::R5G6B5UnormPack16);
        let cb = encode_color_surface(&chip, &image, &ImageView::of(&image), EncodeOptions::default());
        assert_eq!(cb_color_attrib::FORCE_DST_ALPHA_1_GFX6.get(cb.cb_color_attrib), 1);
        assert_eq!(cb_color_info::COMP_SWAP.get(cb.cb_color_info), swap::STD_REV);
    }

    #[test]
    fn test_dcc_control_block_sizes() {
        let vega = ChipInfo::for_family(ChipFamily::Vega10);
        let mut image = unified_image(Format::R8Unorm);
        image.surface.bpe = 1;
        image.samples = 2;
        assert_eq!(
            dcc_max_uncompressed_block_size(&vega, &image),
            cb_dcc_control::MAX_BLOCK_SIZE_64B
        );

        let navi = ChipInfo::for_family(ChipFamily::Navi21);
        assert_eq!(
            dcc_max_uncompressed_block_size(&navi, &image),
            cb_dcc_control::MAX_BLOCK_SIZE_256B
        );

        let apu = ChipInfo::for_family(ChipFamily::VanGogh);
        assert_eq!(dcc_min_compressed_block_size(&apu), cb_dcc_control::MIN_BLOCK_SIZE_64B);
        assert_eq!(dcc_min_compressed_block_size(&navi), cb_dcc_control::MIN_BLOCK_SIZE_32B);
    }

    #[test]
    fn test_dcc_control_max_comp_frags_override() {
        let chip = ChipInfo::for_family(ChipFamily::Gfx1103R2);
        let mut image = unified_image(Format::R8G8B8A8Unorm);
        image.meta.dcc_levels = 1;
        image.samples = 4;
        let value = dcc_control(&chip, &image, &ImageView::of(&image));
        assert_eq!(cb_dcc_control::ENABLE_MAX_COMP_FRAG_OVERRIDE.get(value), 1);
        assert_eq!(cb_dcc_control::MAX_COMP_FRAGS.get(value), 1);
        assert_eq!(cb_dcc_control::DISABLE_CONSTANT_ENCODE_REG.get(value), 1);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let chip = ChipInfo::for_family(ChipFamily::Navi21);
        let mut image = unified_image(Format::R8G8B8A8Unorm);
        image.meta.dcc_levels = 1;
        image.meta.has_cmask = true;
        let view = ImageView::of(&image);
        let a = encode_color_surface(&chip, &image, &view, EncodeOptions::default());
        let b = encode_color_surface(&chip, &image, &view, EncodeOptions::default());
        assert_eq!(a, b);
    }
}
