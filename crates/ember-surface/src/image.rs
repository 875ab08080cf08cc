//! # Image Surface Metadata
//!
//! The layout facts the encoders need about a bound image: where it lives,
//! how it is tiled, and which compression metadata it carries. Layout
//! computation itself happens elsewhere; these structs carry its results.

use arrayvec::ArrayVec;
use ember_core::{GfxLevel, GpuAddr};

use crate::format::Format;

/// Maximum mip levels of a surface
pub const MAX_MIP_LEVELS: usize = 15;

// =============================================================================
// BASIC TYPES
// =============================================================================

/// Image dimensionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ImageType {
    D1,
    D2,
    D3,
}

/// View dimensionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ViewType {
    D1,
    D2,
    D3,
    Cube,
    D1Array,
    D2Array,
    CubeArray,
}

/// Extent in texels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3d {
    /// 2D extent with depth 1
    pub const fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }
}

bitflags::bitflags! {
    /// Image usage bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Copy source
        const TRANSFER_SRC = 1 << 0;
        /// Copy destination
        const TRANSFER_DST = 1 << 1;
        /// Sampled in shaders
        const SAMPLED = 1 << 2;
        /// Storage image
        const STORAGE = 1 << 3;
        /// Color attachment
        const COLOR_ATTACHMENT = 1 << 4;
        /// Depth/stencil attachment
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        /// Input attachment
        const INPUT_ATTACHMENT = 1 << 7;
        /// Fragment shading rate attachment
        const FRAGMENT_SHADING_RATE_ATTACHMENT = 1 << 8;
    }
}

bitflags::bitflags! {
    /// Image aspects
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImageAspects: u32 {
        /// Color
        const COLOR = 1 << 0;
        /// Depth
        const DEPTH = 1 << 1;
        /// Stencil
        const STENCIL = 1 << 2;
    }
}

// =============================================================================
// SURFACE LAYOUT
// =============================================================================

/// Legacy tiling mode of one mip level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfMode {
    /// Linear aligned
    #[default]
    Linear,
    /// 1D tiled (micro tiles only)
    Tiled1d,
    /// 2D tiled (macro tiles, bank swizzle applies)
    Tiled2d,
}

/// Legacy per-level layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyLevel {
    /// Offset from the image base in 256-byte units
    pub offset_256b: u32,
    /// Width in blocks
    pub nblk_x: u32,
    /// Height in blocks
    pub nblk_y: u32,
    /// Tiling mode
    pub mode: SurfMode,
    /// Offset of this level's DCC within the metadata
    pub dcc_offset: u64,
    /// Size of one layer of this level in dwords
    pub slice_size_dw: u32,
}

/// Legacy FMASK layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct LegacyFmask {
    pub pitch_in_pixels: u32,
    pub tiling_index: u32,
    pub slice_tile_max: u32,
    pub bankh: u32,
}

/// GFX6-8 surface layout
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LegacyLayout {
    /// Color or depth levels
    pub levels: ArrayVec<LegacyLevel, MAX_MIP_LEVELS>,
    /// Stencil levels of a depth/stencil surface
    pub stencil_levels: ArrayVec<LegacyLevel, MAX_MIP_LEVELS>,
    /// Tile mode index per level
    pub tiling_index: [u8; MAX_MIP_LEVELS],
    /// Stencil tile mode index per level
    pub stencil_tiling_index: [u8; MAX_MIP_LEVELS],
    /// Macro tile mode index
    pub macro_tile_index: u8,
    /// Bank height
    pub bankh: u32,
    /// CMASK slice tile max
    pub cmask_slice_tile_max: u32,
    /// FMASK layout
    pub fmask: LegacyFmask,
}

/// DCC placement flags computed by the layout code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct DccMeta {
    pub rb_aligned: bool,
    pub pipe_aligned: bool,
    pub independent_64b_blocks: bool,
    pub independent_128b_blocks: bool,
    pub max_compressed_block_size: u32,
}

/// GFX9+ surface layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct UnifiedLayout {
    pub swizzle_mode: u32,
    pub epitch: u32,
    pub surf_offset: u64,
    pub surf_pitch: u32,
    pub resource_type: u32,
    pub fmask_swizzle_mode: u32,
    pub dcc: DccMeta,
    pub stencil_offset: u64,
    pub stencil_swizzle_mode: u32,
    pub stencil_epitch: u32,
    /// Bytes between consecutive layers
    pub surf_slice_size: u64,
    /// Per-level offsets, filled in for linear surfaces only
    pub level_offsets: [u64; MAX_MIP_LEVELS],
}

/// Generation-specific layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceLayout {
    /// GFX6-8
    Legacy(LegacyLayout),
    /// GFX9+
    Unified(UnifiedLayout),
}

/// Computed surface of the image's single plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    /// Bytes per element
    pub bpe: u32,
    /// Block width in texels
    pub blk_w: u32,
    /// Linear layout
    pub is_linear: bool,
    /// Bank/pipe swizzle ORed into the base address
    pub tile_swizzle: u8,
    /// FMASK swizzle
    pub fmask_tile_swizzle: u8,
    /// Offset of DCC or HTILE
    pub meta_offset: u64,
    /// Offset of CMASK
    pub cmask_offset: u64,
    /// Offset of FMASK
    pub fmask_offset: u64,
    /// Alignment of the metadata surface
    pub meta_alignment_log2: u32,
    /// Bytes of memory the whole image needs, metadata included
    pub total_size: u64,
    /// Required alignment of the image memory
    pub alignment_log2: u32,
    /// Generation-specific layout
    pub layout: SurfaceLayout,
}

impl Surface {
    /// A tiled GFX9+ surface with no metadata
    pub fn unified(bpe: u32, layout: UnifiedLayout) -> Self {
        Self {
            bpe,
            blk_w: 1,
            is_linear: false,
            tile_swizzle: 0,
            fmask_tile_swizzle: 0,
            meta_offset: 0,
            cmask_offset: 0,
            fmask_offset: 0,
            meta_alignment_log2: 0,
            total_size: 0,
            alignment_log2: 8,
            layout: SurfaceLayout::Unified(layout),
        }
    }

    /// A GFX6-8 surface with no metadata
    pub fn legacy(bpe: u32, layout: LegacyLayout) -> Self {
        Self {
            layout: SurfaceLayout::Legacy(layout),
            ..Self::unified(bpe, UnifiedLayout::default())
        }
    }

    /// GFX9+ layout, or the default one for a legacy surface
    pub fn unified_layout(&self) -> UnifiedLayout {
        match &self.layout {
            SurfaceLayout::Unified(u) => *u,
            SurfaceLayout::Legacy(_) => UnifiedLayout::default(),
        }
    }
}

// =============================================================================
// METADATA
// =============================================================================

/// Compression metadata attached to an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    /// FMASK present
    pub has_fmask: bool,
    /// CMASK present
    pub has_cmask: bool,
    /// FMASK readable by the texture unit without decompression
    pub tc_compat_cmask: bool,
    /// Number of leading levels with DCC
    pub dcc_levels: u32,
    /// Number of leading levels with HTILE
    pub htile_levels: u32,
    /// HTILE readable by the texture unit
    pub tc_compat_htile: bool,
    /// HTILE carries 4-bit VRS rates
    pub vrs_htile: bool,
    /// DB iterates 256 samples on flush
    pub iterate256: bool,
}

/// Whether a depth image needs `ITERATE_256`
///
/// Required for multisampled TC-compatible HTILE depth/stencil on GFX10+.
pub fn requires_iterate256(
    gfx_level: GfxLevel,
    usage: ImageUsage,
    tc_compat_htile: bool,
    samples: u32,
) -> bool {
    gfx_level >= GfxLevel::Gfx10
        && usage.intersects(ImageUsage::DEPTH_STENCIL_ATTACHMENT | ImageUsage::TRANSFER_DST)
        && tc_compat_htile
        && samples > 1
}

// =============================================================================
// IMAGE
// =============================================================================

/// A bound image as seen by the encoders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Format
    pub format: Format,
    /// Dimensionality
    pub image_type: ImageType,
    /// Base level extent
    pub extent: Extent3d,
    /// Mip level count
    pub mip_levels: u32,
    /// Array layer count
    pub array_layers: u32,
    /// Sample count
    pub samples: u32,
    /// Usage
    pub usage: ImageUsage,
    /// Virtual address of the bound memory plus bind offset
    pub va: GpuAddr,
    /// Computed surface
    pub surface: Surface,
    /// Compression metadata
    pub meta: Metadata,
    /// Exportable to other processes or APIs
    pub shareable: bool,
}

impl Image {
    /// Single-level, single-sample 2D image
    pub fn new_2d(format: Format, extent: Extent3d, surface: Surface) -> Self {
        Self {
            format,
            image_type: ImageType::D2,
            extent,
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage: ImageUsage::empty(),
            va: GpuAddr::null(),
            surface,
            meta: Metadata::default(),
            shareable: false,
        }
    }

    /// DCC is enabled at `level`
    pub fn dcc_enabled(&self, level: u32) -> bool {
        level < self.meta.dcc_levels
    }

    /// HTILE is enabled at `level`
    pub fn htile_enabled(&self, level: u32) -> bool {
        level < self.meta.htile_levels
    }

    /// Stencil HTILE tiling can be skipped
    pub fn tile_stencil_disabled(&self, gfx_level: GfxLevel) -> bool {
        if gfx_level >= GfxLevel::Gfx9 {
            !self.format.has_stencil() && !self.meta.vrs_htile
        } else {
            // TILE_STENCIL_DISABLE must stay 0 with TC-compat HTILE even without stencil.
            !self.format.has_stencil() && !self.meta.tc_compat_htile
        }
    }

    /// Legacy tile mode index of a level
    pub fn tile_mode_index(&self, level: u32, stencil: bool) -> u32 {
        match &self.surface.layout {
            SurfaceLayout::Legacy(l) => {
                let table = if stencil {
                    &l.stencil_tiling_index
                } else {
                    &l.tiling_index
                };
                table.get(level as usize).copied().map_or(0, u32::from)
            }
            SurfaceLayout::Unified(_) => 0,
        }
    }
}

/// Placement of one subresource within the image memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubresourceLayout {
    /// Byte offset from the start of the image memory
    pub offset: u64,
    /// Bytes of the subresource
    pub size: u64,
    /// Bytes between rows
    pub row_pitch: u64,
    /// Bytes between array layers
    pub array_pitch: u64,
    /// Bytes between depth slices
    pub depth_pitch: u64,
}

/// Size of `extent` at `level`, never below 1
const fn minify(extent: u32, level: u32) -> u64 {
    let size = if level >= 32 { 0 } else { extent >> level };
    if size == 0 { 1 } else { size as u64 }
}

impl Image {
    /// Where `aspect` of `level`/`layer` lives in the image memory
    ///
    /// `None` for a level the surface does not have.
    pub fn subresource_layout(
        &self,
        aspect: ImageAspects,
        level: u32,
        layer: u32,
    ) -> Option<SubresourceLayout> {
        if level >= self.mip_levels {
            return None;
        }
        let surf = &self.surface;
        let stencil = aspect == ImageAspects::STENCIL;
        let depth = if self.image_type == ImageType::D3 {
            minify(self.extent.depth, level)
        } else {
            1
        };

        let layout = match &surf.layout {
            SurfaceLayout::Unified(u) => {
                let mut offset = if stencil { u.stencil_offset } else { u.surf_offset };
                if surf.is_linear {
                    offset += *u.level_offsets.get(level as usize)?;
                }
                offset += u.surf_slice_size * u64::from(layer);
                SubresourceLayout {
                    offset,
                    size: u.surf_slice_size * depth,
                    row_pitch: u64::from(u.surf_pitch) * u64::from(surf.bpe),
                    array_pitch: u.surf_slice_size,
                    depth_pitch: u.surf_slice_size,
                }
            }
            SurfaceLayout::Legacy(l) => {
                let levels = if stencil { &l.stencil_levels } else { &l.levels };
                let info = levels.get(level as usize)?;
                let slice_size = u64::from(info.slice_size_dw) * 4;
                // Stencil is one byte per element next to its depth plane.
                let bpe = if stencil { 1 } else { surf.bpe };
                SubresourceLayout {
                    offset: u64::from(info.offset_256b) * 256 + slice_size * u64::from(layer),
                    size: slice_size * depth,
                    row_pitch: u64::from(info.nblk_x) * u64::from(bpe),
                    array_pitch: slice_size,
                    depth_pitch: slice_size,
                }
            }
        };
        Some(layout)
    }
}

/// View of a compressed image as its uncompressed block format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NbcView {
    /// Byte offset of the viewed level
    pub base_address_offset: u64,
    /// Swizzle of the viewed level
    pub tile_swizzle: u8,
    /// Level within the block view
    pub level: u32,
    /// Level count of the block view
    pub num_levels: u32,
}

/// Image view bound as a render target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageView {
    /// View format
    pub format: Format,
    /// View dimensionality
    pub view_type: ViewType,
    /// First mip level
    pub base_mip_level: u32,
    /// First array layer
    pub base_array_layer: u32,
    /// Layer count
    pub layer_count: u32,
    /// Extent of the base level of the view
    pub extent: Extent3d,
    /// DCC must not be enabled through CB_COLOR_INFO
    pub disable_dcc_mrt: bool,
    /// Non-block-compressed view state
    pub nbc_view: Option<NbcView>,
}

impl ImageView {
    /// Whole-image 2D view of level 0
    pub fn of(image: &Image) -> Self {
        Self {
            format: image.format,
            view_type: ViewType::D2,
            base_mip_level: 0,
            base_array_layer: 0,
            layer_count: image.array_layers,
            extent: image.extent,
            disable_dcc_mrt: false,
            nbc_view: None,
        }
    }

    /// One past the last layer addressed by the view
    pub fn max_layer_count(&self) -> u32 {
        match self.view_type {
            ViewType::D3 => self.extent.depth,
            _ => self.base_array_layer + self.layer_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_gating() {
        let mut image = Image::new_2d(
            Format::R8G8B8A8Unorm,
            Extent3d::new_2d(64, 64),
            Surface::unified(4, UnifiedLayout::default()),
        );
        image.meta.dcc_levels = 2;
        assert!(image.dcc_enabled(1));
        assert!(!image.dcc_enabled(2));
        assert!(!image.htile_enabled(0));
    }

    #[test]
    fn test_unified_subresource_layout() {
        let layout = UnifiedLayout {
            surf_pitch: 64,
            surf_slice_size: 64 * 64 * 4,
            stencil_offset: 0x8000,
            ..UnifiedLayout::default()
        };
        let mut image = Image::new_2d(
            Format::D32SfloatS8Uint,
            Extent3d::new_2d(64, 64),
            Surface::unified(4, layout),
        );
        image.array_layers = 4;

        let depth = image.subresource_layout(ImageAspects::DEPTH, 0, 2).unwrap();
        assert_eq!(depth.offset, 2 * 64 * 64 * 4);
        assert_eq!(depth.row_pitch, 256);
        assert_eq!(depth.size, 64 * 64 * 4);
        assert_eq!(depth.array_pitch, depth.size);

        let stencil = image.subresource_layout(ImageAspects::STENCIL, 0, 0).unwrap();
        assert_eq!(stencil.offset, 0x8000);
        assert!(image.subresource_layout(ImageAspects::DEPTH, 1, 0).is_none());
    }

    #[test]
    fn test_linear_levels_and_3d_depth() {
        let mut layout = UnifiedLayout {
            surf_pitch: 32,
            surf_slice_size: 32 * 32,
            ..UnifiedLayout::default()
        };
        layout.level_offsets[1] = 0x4000;
        let mut surface = Surface::unified(1, layout);
        surface.is_linear = true;
        let mut image = Image::new_2d(
            Format::R8Unorm,
            Extent3d {
                width: 32,
                height: 32,
                depth: 8,
            },
            surface,
        );
        image.image_type = ImageType::D3;
        image.mip_levels = 2;

        let level1 = image.subresource_layout(ImageAspects::COLOR, 1, 0).unwrap();
        assert_eq!(level1.offset, 0x4000);
        assert_eq!(level1.size, 32 * 32 * 4);
        assert_eq!(level1.depth_pitch, 32 * 32);
    }

    #[test]
    fn test_legacy_subresource_layout() {
        let mut layout = LegacyLayout::default();
        layout.levels.push(LegacyLevel {
            offset_256b: 0x10,
            nblk_x: 64,
            nblk_y: 32,
            slice_size_dw: 64 * 32,
            ..LegacyLevel::default()
        });
        let mut image = Image::new_2d(
            Format::R8G8B8A8Unorm,
            Extent3d::new_2d(64, 32),
            Surface::legacy(4, layout),
        );
        image.array_layers = 3;

        let sub = image.subresource_layout(ImageAspects::COLOR, 0, 1).unwrap();
        assert_eq!(sub.offset, 0x1000 + 64 * 32 * 4);
        assert_eq!(sub.row_pitch, 256);
        assert_eq!(sub.size, 64 * 32 * 4);
        assert!(image.subresource_layout(ImageAspects::STENCIL, 0, 0).is_none());
    }

    #[test]
    fn test_iterate256_requirement() {
        let usage = ImageUsage::DEPTH_STENCIL_ATTACHMENT;
        assert!(requires_iterate256(GfxLevel::Gfx10_3, usage, true, 4));
        assert!(!requires_iterate256(GfxLevel::Gfx9, usage, true, 4));
        assert!(!requires_iterate256(GfxLevel::Gfx10_3, usage, true, 1));
    }

    #[test]
    fn test_3d_view_layers() {
        let image = Image::new_2d(
            Format::R8Unorm,
            Extent3d {
                width: 8,
                height: 8,
                depth: 16,
            },
            Surface::unified(1, UnifiedLayout::default()),
        );
        let mut view = ImageView::of(&image);
        assert_eq!(view.max_layer_count(), 1);
        view.view_type = ViewType::D3;
        assert_eq!(view.max_layer_count(), 16);
    }
}
