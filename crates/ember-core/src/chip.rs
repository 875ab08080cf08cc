//! # Chip Description
//!
//! Hardware generation and per-chip properties queried once from the kernel
//! and consumed read-only by the rest of the driver.

// =============================================================================
// GFX LEVEL
// =============================================================================

/// Graphics IP generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GfxLevel {
    /// Southern Islands
    Gfx6,
    /// Sea Islands
    Gfx7,
    /// Volcanic Islands / Polaris
    Gfx8,
    /// Vega / Raven
    Gfx9,
    /// Navi 1x
    Gfx10,
    /// Navi 2x (RDNA2)
    Gfx10_3,
    /// Navi 3x (RDNA3)
    Gfx11,
    /// RDNA3.5 APUs
    Gfx11_5,
}

impl GfxLevel {
    /// Register layout family used by the surface encoder
    pub const fn surface_tier(self) -> SurfaceTier {
        match self {
            Self::Gfx6 | Self::Gfx7 | Self::Gfx8 => SurfaceTier::Legacy,
            Self::Gfx9 | Self::Gfx10 | Self::Gfx10_3 => SurfaceTier::Unified,
            Self::Gfx11 | Self::Gfx11_5 => SurfaceTier::Latest,
        }
    }
}

/// Surface register layout family
///
/// ```text
/// Legacy   GFX6-8    tile-mode-index tables, pitch/slice tile max
/// Unified  GFX9-10.3 swizzle modes, epitch, mip0 extents
/// Latest   GFX11+    unified layout with relocated format/fragment fields
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceTier {
    /// GFX6 through GFX8
    Legacy,
    /// GFX9 through GFX10.3
    Unified,
    /// GFX11 and newer
    Latest,
}

// =============================================================================
// CHIP FAMILY
// =============================================================================

/// ASIC family, ordered by release
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum ChipFamily {
    Tahiti,
    Hawaii,
    Kabini,
    Tonga,
    Carrizo,
    Polaris10,
    Vega10,
    Raven,
    Raven2,
    Renoir,
    Navi10,
    Navi21,
    VanGogh,
    Navi31,
    Navi33,
    Gfx1103R1,
    Gfx1103R2,
    Gfx1150,
}

impl ChipFamily {
    /// Graphics generation of this family
    pub const fn gfx_level(self) -> GfxLevel {
        match self {
            Self::Tahiti => GfxLevel::Gfx6,
            Self::Hawaii | Self::Kabini => GfxLevel::Gfx7,
            Self::Tonga | Self::Carrizo | Self::Polaris10 => GfxLevel::Gfx8,
            Self::Vega10 | Self::Raven | Self::Raven2 | Self::Renoir => GfxLevel::Gfx9,
            Self::Navi10 => GfxLevel::Gfx10,
            Self::Navi21 | Self::VanGogh => GfxLevel::Gfx10_3,
            Self::Navi31 | Self::Navi33 | Self::Gfx1103R1 | Self::Gfx1103R2 => GfxLevel::Gfx11,
            Self::Gfx1150 => GfxLevel::Gfx11_5,
        }
    }

    /// Integrated parts share system memory
    pub const fn is_apu(self) -> bool {
        matches!(
            self,
            Self::Kabini
                | Self::Carrizo
                | Self::Raven
                | Self::Raven2
                | Self::Renoir
                | Self::VanGogh
                | Self::Gfx1103R1
                | Self::Gfx1103R2
                | Self::Gfx1150
        )
    }
}

// =============================================================================
// CHIP INFO
// =============================================================================

/// Static properties of one GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    /// Graphics generation
    pub gfx_level: GfxLevel,
    /// ASIC family
    pub family: ChipFamily,
    /// Discrete GPU with its own VRAM
    pub has_dedicated_vram: bool,
    /// Kernel supports stable power states for profiling
    pub has_stable_pstate: bool,
    /// HTILE two-plane + ITERATE_256 decompression bug
    pub has_two_planes_iterate256_bug: bool,
    /// DCC constant encoding is usable
    pub has_dcc_constant_encode: bool,
    /// Firmware requires register shadowing
    pub register_shadowing_required: bool,
    /// Pad gfx IBs with type-2 packets instead of type-3 NOPs
    pub gfx_ib_pad_with_type2: bool,
    /// Performance counter blocks are described for this chip
    pub has_perf_counters: bool,
    /// GPU timestamp crystal frequency in kHz
    pub clock_crystal_freq: u32,
    /// Number of compute units
    pub num_cu: u32,
    /// Number of shader engines
    pub max_se: u32,
    /// GB_TILE_MODE* values (GFX6-8)
    pub tile_mode_array: [u32; 32],
    /// GB_MACROTILE_MODE* values (GFX7-8)
    pub macrotile_mode_array: [u32; 16],
}

impl ChipInfo {
    /// Typical properties of a family, as reported by a current kernel
    pub fn for_family(family: ChipFamily) -> Self {
        let gfx_level = family.gfx_level();
        let has_dedicated_vram = !family.is_apu();
        let num_cu = match family {
            ChipFamily::Tahiti => 32,
            ChipFamily::Hawaii => 44,
            ChipFamily::Kabini | ChipFamily::Carrizo => 8,
            ChipFamily::Tonga => 32,
            ChipFamily::Polaris10 => 36,
            ChipFamily::Vega10 => 64,
            ChipFamily::Raven | ChipFamily::Raven2 | ChipFamily::Renoir => 11,
            ChipFamily::Navi10 => 40,
            ChipFamily::Navi21 => 80,
            ChipFamily::VanGogh => 8,
            ChipFamily::Navi31 => 96,
            ChipFamily::Navi33 => 32,
            ChipFamily::Gfx1103R1 | ChipFamily::Gfx1103R2 => 12,
            ChipFamily::Gfx1150 => 16,
        };

        Self {
            gfx_level,
            family,
            has_dedicated_vram,
            has_stable_pstate: true,
            has_two_planes_iterate256_bug: gfx_level <= GfxLevel::Gfx10,
            has_dcc_constant_encode: matches!(family, ChipFamily::Raven2 | ChipFamily::Renoir)
                || gfx_level >= GfxLevel::Gfx10,
            register_shadowing_required: has_dedicated_vram && gfx_level >= GfxLevel::Gfx11,
            gfx_ib_pad_with_type2: gfx_level == GfxLevel::Gfx6,
            has_perf_counters: gfx_level >= GfxLevel::Gfx7,
            clock_crystal_freq: 100_000,
            num_cu,
            max_se: if has_dedicated_vram { 4 } else { 1 },
            tile_mode_array: [0; 32],
            macrotile_mode_array: [0; 16],
        }
    }

    /// Register layout family
    #[inline]
    pub const fn surface_tier(&self) -> SurfaceTier {
        self.gfx_level.surface_tier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_tiers() {
        assert_eq!(GfxLevel::Gfx8.surface_tier(), SurfaceTier::Legacy);
        assert_eq!(GfxLevel::Gfx9.surface_tier(), SurfaceTier::Unified);
        assert_eq!(GfxLevel::Gfx10_3.surface_tier(), SurfaceTier::Unified);
        assert_eq!(GfxLevel::Gfx11.surface_tier(), SurfaceTier::Latest);
    }

    #[test]
    fn test_family_ordering() {
        assert!(ChipFamily::Gfx1103R2 > ChipFamily::Gfx1103R1);
        assert!(GfxLevel::Gfx10_3 > GfxLevel::Gfx10);
        assert!(GfxLevel::Gfx11_5 > GfxLevel::Gfx11);
    }

    #[test]
    fn test_for_family_apu() {
        let info = ChipInfo::for_family(ChipFamily::Gfx1103R1);
        assert!(!info.has_dedicated_vram);
        assert!(!info.register_shadowing_required);
        assert_eq!(info.gfx_level, GfxLevel::Gfx11);
    }
}
