//! # Depth/Stencil Surface Encoding
//!
//! Builds the DB_* register block for a depth/stencil attachment and for
//! the HTILE-backed surface used to copy VRS rates.

use ember_core::{ChipInfo, GfxLevel, GpuAddr};

use crate::format::Format;
use crate::image::{Image, ImageAspects, ImageView, SurfaceLayout};
use crate::regs::{
    db_depth_info, db_depth_size, db_depth_size_legacy, db_depth_view, db_htile_surface, db_info2,
    db_render_control, db_render_override2, db_stencil_info, db_stencil_info_legacy, db_z_info,
    db_z_info_legacy, gb_macrotile_mode, gb_tile_mode, stencil_format, z_format,
};

/// Register state of one depth/stencil attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub struct DepthStencilSurfaceDescriptor {
    pub db_z_read_base: u64,
    pub db_z_write_base: u64,
    pub db_stencil_read_base: u64,
    pub db_stencil_write_base: u64,
    pub db_htile_data_base: u64,
    pub db_z_info: u32,
    pub db_z_info2: u32,
    pub db_stencil_info: u32,
    pub db_stencil_info2: u32,
    pub db_depth_info: u32,
    pub db_depth_view: u32,
    pub db_depth_size: u32,
    pub db_depth_slice: u32,
    pub db_htile_surface: u32,
    pub db_render_control: u32,
    pub db_render_override2: u32,
}

/// Z planes after which the DB decompresses a TC-compatible HTILE surface
pub fn decompress_on_z_planes(chip: &ChipInfo, image: &Image, view: &ImageView) -> u32 {
    debug_assert!(image.meta.tc_compat_htile);

    if chip.gfx_level >= GfxLevel::Gfx9 {
        let mut planes = 4;
        if view.format == Format::D16Unorm && image.samples > 1 {
            planes = 2;
        }

        // DB hang with ITERATE_256 on 4x MSAA depth/stencil.
        if chip.has_two_planes_iterate256_bug
            && image.meta.iterate256
            && !image.tile_stencil_disabled(chip.gfx_level)
            && image.samples == 4
        {
            planes = 1;
        }

        planes + 1
    } else if view.format == Format::D16Unorm {
        // Z plane compression is 32-bit only here.
        1
    } else if image.samples <= 1 {
        5
    } else if image.samples <= 4 {
        3
    } else {
        2
    }
}

/// DB_RENDER_CONTROL tile limits for GFX11
pub fn db_render_control_gfx11(chip: &ChipInfo, samples: u32) -> u32 {
    let max_tiles = match (chip.has_dedicated_vram, samples) {
        (true, 8) => 6,
        (true, 4) => 13,
        (false, 8) => 7,
        (false, 4) => 15,
        _ => 0,
    };
    db_render_control::MAX_ALLOWED_TILES_IN_WAVE.set(max_tiles)
}

/// Encode the depth/stencil registers of `view` with the accessible `aspects`
///
/// Aspects missing from `aspects` are marked read-only.
pub fn encode_depth_stencil_surface(
    chip: &ChipInfo,
    image: &Image,
    view: &ImageView,
    aspects: ImageAspects,
) -> DepthStencilSurfaceDescriptor {
    let gfx = chip.gfx_level;
    let level = view.base_mip_level;
    let surf = &image.surface;
    let stencil_only = image.format == Format::S8Uint;
    let mut ds = DepthStencilSurfaceDescriptor::default();

    let format = image.format.db_format();
    let stencil = image.format.db_stencil_format();

    let max_slice = view.max_layer_count().saturating_sub(1);
    ds.db_depth_view = db_depth_view::SLICE_START.set(view.base_array_layer)
        | db_depth_view::SLICE_MAX.set(max_slice)
        | db_depth_view::Z_READ_ONLY.flag(!aspects.contains(ImageAspects::DEPTH))
        | db_depth_view::STENCIL_READ_ONLY.flag(!aspects.contains(ImageAspects::STENCIL));
    if gfx >= GfxLevel::Gfx10 {
        ds.db_depth_view |= db_depth_view::SLICE_START_HI.set(view.base_array_layer >> 11)
            | db_depth_view::SLICE_MAX_HI.set(max_slice >> 11);
    }

    let va = image.va.raw();
    let mut z_offs = va;
    let mut s_offs = va;

    ds.db_render_override2 = db_render_override2::DECOMPRESS_Z_ON_FLUSH.flag(image.samples >= 4)
        | db_render_override2::CENTROID_COMPUTATION_MODE.flag(gfx >= GfxLevel::Gfx10_3);

    match &surf.layout {
        SurfaceLayout::Unified(u) => {
            debug_assert_eq!(u.surf_offset, 0);
            s_offs += u.stencil_offset;

            ds.db_z_info = db_z_info::FORMAT.set(format)
                | db_z_info::NUM_SAMPLES.set(image.samples.max(1).ilog2())
                | db_z_info::SW_MODE.set(u.swizzle_mode)
                | db_z_info::MAXMIP.set(image.mip_levels.saturating_sub(1))
                | db_z_info::ZRANGE_PRECISION.flag(true)
                | db_z_info::ITERATE_256.flag(gfx >= GfxLevel::Gfx11);
            ds.db_stencil_info = db_stencil_info::FORMAT.set(stencil)
                | db_stencil_info::SW_MODE.set(u.stencil_swizzle_mode)
                | db_stencil_info::ITERATE_256.flag(gfx >= GfxLevel::Gfx11);

            if gfx == GfxLevel::Gfx9 {
                ds.db_z_info2 = db_info2::EPITCH.set(u.epitch);
                ds.db_stencil_info2 = db_info2::EPITCH.set(u.stencil_epitch);
            }

            ds.db_depth_view |= db_depth_view::MIPID.set(level);
            ds.db_depth_size = db_depth_size::X_MAX.set(image.extent.width.saturating_sub(1))
                | db_depth_size::Y_MAX.set(image.extent.height.saturating_sub(1));

            if image.htile_enabled(level) {
                ds.db_z_info |= db_z_info::TILE_SURFACE_ENABLE.flag(true);

                if image.meta.tc_compat_htile {
                    let planes = decompress_on_z_planes(chip, image, view);
                    ds.db_z_info |= db_z_info::DECOMPRESS_ON_N_ZPLANES.set(planes);

                    if gfx >= GfxLevel::Gfx10 {
                        let iterate256 = image.meta.iterate256;
                        ds.db_z_info |= db_z_info::ITERATE_FLUSH.flag(true)
                            | db_z_info::ITERATE_256.flag(iterate256);
                        ds.db_stencil_info |= db_stencil_info::ITERATE_FLUSH.flag(true)
                            | db_stencil_info::ITERATE_256.flag(iterate256);
                    } else {
                        ds.db_z_info |= db_z_info::ITERATE_FLUSH_GFX9.flag(true);
                        ds.db_stencil_info |= db_stencil_info::ITERATE_FLUSH_GFX9.flag(true);
                    }
                }

                if image.tile_stencil_disabled(gfx) {
                    ds.db_stencil_info |= db_stencil_info::TILE_STENCIL_DISABLE.flag(true);
                }

                ds.db_htile_data_base = (va + surf.meta_offset) >> 8;
                ds.db_htile_surface = db_htile_surface::FULL_CACHE.flag(true)
                    | db_htile_surface::PIPE_ALIGNED.flag(true)
                    | db_htile_surface::RB_ALIGNED.flag(gfx == GfxLevel::Gfx9);

                if image.meta.vrs_htile {
                    ds.db_htile_surface |= db_htile_surface::VRS_HTILE_ENCODING
                        .set(db_htile_surface::VRS_HTILE_4BIT_ENCODING);
                }
            }

            if gfx >= GfxLevel::Gfx11 {
                ds.db_render_control |= db_render_control_gfx11(chip, image.samples);
            }
        }
        SurfaceLayout::Legacy(l) => {
            let depth_level = l.levels.get(level as usize).copied().unwrap_or_default();
            let stencil_level = l.stencil_levels.get(level as usize).copied().unwrap_or_default();
            let level_info = if stencil_only { stencil_level } else { depth_level };

            z_offs += u64::from(depth_level.offset_256b) * 256;
            s_offs += u64::from(stencil_level.offset_256b) * 256;

            ds.db_depth_info = db_depth_info::ADDR5_SWIZZLE_MASK.flag(!image.meta.tc_compat_htile);
            ds.db_z_info = db_z_info_legacy::FORMAT.set(format)
                | db_z_info_legacy::ZRANGE_PRECISION.flag(true);
            ds.db_stencil_info = db_stencil_info_legacy::FORMAT.set(stencil);

            if image.samples > 1 {
                ds.db_z_info |= db_z_info_legacy::NUM_SAMPLES.set(image.samples.ilog2());
            }

            if gfx >= GfxLevel::Gfx7 {
                let lookup = |index: u8| {
                    chip.tile_mode_array
                        .get(usize::from(index))
                        .copied()
                        .unwrap_or(0)
                };
                let tiling_index = l.tiling_index.get(level as usize).copied().unwrap_or(0);
                let stencil_index = l.stencil_tiling_index.get(level as usize).copied().unwrap_or(0);
                let stencil_tile_mode = lookup(stencil_index);
                let tile_mode = if stencil_only {
                    stencil_tile_mode
                } else {
                    lookup(tiling_index)
                };
                let macro_mode = chip
                    .macrotile_mode_array
                    .get(usize::from(l.macro_tile_index))
                    .copied()
                    .unwrap_or(0);

                ds.db_depth_info |= db_depth_info::ARRAY_MODE.set(gb_tile_mode::ARRAY_MODE.get(tile_mode))
                    | db_depth_info::PIPE_CONFIG.set(gb_tile_mode::PIPE_CONFIG.get(tile_mode))
                    | db_depth_info::BANK_WIDTH.set(gb_macrotile_mode::BANK_WIDTH.get(macro_mode))
                    | db_depth_info::BANK_HEIGHT.set(gb_macrotile_mode::BANK_HEIGHT.get(macro_mode))
                    | db_depth_info::MACRO_TILE_ASPECT
                        .set(gb_macrotile_mode::MACRO_TILE_ASPECT.get(macro_mode))
                    | db_depth_info::NUM_BANKS.set(gb_macrotile_mode::NUM_BANKS.get(macro_mode));
                ds.db_z_info |= db_z_info_legacy::TILE_SPLIT.set(gb_tile_mode::TILE_SPLIT.get(tile_mode));
                ds.db_stencil_info |=
                    db_stencil_info_legacy::TILE_SPLIT.set(gb_tile_mode::TILE_SPLIT.get(stencil_tile_mode));
            } else {
                let depth_index = image.tile_mode_index(level, false);
                let stencil_index = image.tile_mode_index(level, true);
                let z_index = if stencil_only { stencil_index } else { depth_index };
                ds.db_z_info |= db_z_info_legacy::TILE_MODE_INDEX.set(z_index);
                ds.db_stencil_info |= db_stencil_info_legacy::TILE_MODE_INDEX.set(stencil_index);
            }

            ds.db_depth_size = db_depth_size_legacy::PITCH_TILE_MAX
                .set((level_info.nblk_x / 8).saturating_sub(1))
                | db_depth_size_legacy::HEIGHT_TILE_MAX.set((level_info.nblk_y / 8).saturating_sub(1));
            ds.db_depth_slice = db_depth_size_legacy::SLICE_TILE_MAX
                .set((level_info.nblk_x * level_info.nblk_y / 64).saturating_sub(1));

            if image.htile_enabled(level) {
                ds.db_z_info |= db_z_info_legacy::TILE_SURFACE_ENABLE.flag(true);

                if image.tile_stencil_disabled(gfx) {
                    ds.db_stencil_info |= db_stencil_info_legacy::TILE_STENCIL_DISABLE.flag(true);
                }

                ds.db_htile_data_base = (va + surf.meta_offset) >> 8;
                ds.db_htile_surface = db_htile_surface::FULL_CACHE.flag(true);

                if image.meta.tc_compat_htile {
                    let planes = decompress_on_z_planes(chip, image, view);
                    ds.db_htile_surface |= db_htile_surface::TC_COMPATIBLE.flag(true);
                    ds.db_z_info |= db_z_info_legacy::DECOMPRESS_ON_N_ZPLANES.set(planes);
                }
            }
        }
    }

    ds.db_z_read_base = z_offs >> 8;
    ds.db_z_write_base = z_offs >> 8;
    ds.db_stencil_read_base = s_offs >> 8;
    ds.db_stencil_write_base = s_offs >> 8;

    ds
}

/// Encode the HTILE-only surface that receives VRS rates
///
/// `image` is the D16 VRS image, `htile_va` the address of its HTILE buffer.
pub fn encode_vrs_surface(image: &Image, htile_va: GpuAddr) -> DepthStencilSurfaceDescriptor {
    debug_assert_eq!(image.format, Format::D16Unorm);
    let swizzle_mode = image.surface.unified_layout().swizzle_mode;

    DepthStencilSurfaceDescriptor {
        db_z_info: db_z_info::FORMAT.set(z_format::Z_16)
            | db_z_info::SW_MODE.set(swizzle_mode)
            | db_z_info::ZRANGE_PRECISION.flag(true)
            | db_z_info::TILE_SURFACE_ENABLE.flag(true),
        db_stencil_info: db_stencil_info::FORMAT.set(stencil_format::INVALID),
        db_depth_size: db_depth_size::X_MAX.set(image.extent.width.saturating_sub(1))
            | db_depth_size::Y_MAX.set(image.extent.height.saturating_sub(1)),
        db_htile_data_base: htile_va.raw() >> 8,
        db_htile_surface: db_htile_surface::FULL_CACHE.flag(true)
            | db_htile_surface::PIPE_ALIGNED.flag(true)
            | db_htile_surface::VRS_HTILE_ENCODING.set(db_htile_surface::VRS_HTILE_4BIT_ENCODING),
        ..DepthStencilSurfaceDescriptor::default()
    }
}
