//! # Default MSAA Sample Locations
//!
//! Standard sample patterns for 1x/2x/4x/8x, packed the way the
//! PA_SC_AA_SAMPLE_LOCS registers expect: eight signed 4-bit coordinates per
//! dword in 1/16th pixel units.

// =============================================================================
// PACKING
// =============================================================================

/// Pack four sample positions into one sample location register
pub const fn fill_sreg(coords: [i8; 8]) -> u32 {
    let mut value = 0u32;
    let mut i = 0;
    while i < 8 {
        value |= ((coords[i] as u32) & 0xF) << (i * 4);
        i += 1;
    }
    value
}

/// Sign-extend the 4-bit coordinate at `nibble`
const fn sfield(reg: u32, nibble: usize) -> i32 {
    let raw = ((reg >> (nibble * 4)) & 0xF) as i32;
    if raw & 0x8 != 0 { raw - 16 } else { raw }
}

// =============================================================================
// PATTERNS
// =============================================================================

/// Default pattern of one sample count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplePattern {
    /// Sample count
    pub samples: u32,
    /// Location registers; only the first is used below 8x
    pub locs: [u32; 4],
    /// Largest distance of a sample from the pixel center
    pub max_dist: u32,
    /// PA_SC_CENTROID_PRIORITY_0/1
    pub centroid_priority: u64,
}

/// 1x: a single sample at the pixel center
pub const PATTERN_1X: SamplePattern = SamplePattern {
    samples: 1,
    locs: [fill_sreg([0, 0, 0, 0, 0, 0, 0, 0]), 0, 0, 0],
    max_dist: 0,
    centroid_priority: 0x0000_0000_0000_0000,
};

/// 2x
pub const PATTERN_2X: SamplePattern = SamplePattern {
    samples: 2,
    locs: [fill_sreg([4, 4, -4, -4, 0, 0, 0, 0]), 0, 0, 0],
    max_dist: 4,
    centroid_priority: 0x1010_1010_1010_1010,
};

/// 4x
pub const PATTERN_4X: SamplePattern = SamplePattern {
    samples: 4,
    locs: [fill_sreg([-2, -6, 6, -2, -6, 2, 2, 6]), 0, 0, 0],
    max_dist: 6,
    centroid_priority: 0x3210_3210_3210_3210,
};

/// 8x; the last two registers are unused by the hardware
pub const PATTERN_8X: SamplePattern = SamplePattern {
    samples: 8,
    locs: [
        fill_sreg([1, -3, -1, 3, 5, 1, -3, -5]),
        fill_sreg([-5, 5, -7, -1, 3, 7, 7, -7]),
        0,
        0,
    ],
    max_dist: 7,
    centroid_priority: 0x7654_3210_7654_3210,
};

/// Default pattern for `samples`; unsupported counts fall back to 1x
pub const fn default_pattern(samples: u32) -> &'static SamplePattern {
    match samples {
        2 => &PATTERN_2X,
        4 => &PATTERN_4X,
        8 => &PATTERN_8X,
        _ => &PATTERN_1X,
    }
}

/// Max sample distance by log2 of the sample count
pub const fn default_max_sample_dist(log_samples: u32) -> u32 {
    match log_samples {
        0 => PATTERN_1X.max_dist,
        1 => PATTERN_2X.max_dist,
        2 => PATTERN_4X.max_dist,
        _ => PATTERN_8X.max_dist,
    }
}

impl SamplePattern {
    /// Position of sample `index` in `[0, 1)` pixel coordinates
    pub fn position(&self, index: usize) -> [f32; 2] {
        let reg = self.locs[(index / 4) % 4];
        let slot = (index % 4) * 2;
        let x = sfield(reg, slot);
        let y = sfield(reg, slot + 1);
        [(x + 8) as f32 / 16.0, (y + 8) as f32 / 16.0]
    }
}

// =============================================================================
// DEVICE TABLE
// =============================================================================

/// Sample positions of every default pattern, computed once per device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePositions {
    /// 1x
    pub x1: [[f32; 2]; 1],
    /// 2x
    pub x2: [[f32; 2]; 2],
    /// 4x
    pub x4: [[f32; 2]; 4],
    /// 8x
    pub x8: [[f32; 2]; 8],
}

impl SamplePositions {
    /// Decode all default patterns
    pub fn new() -> Self {
        Self {
            x1: core::array::from_fn(|i| PATTERN_1X.position(i)),
            x2: core::array::from_fn(|i| PATTERN_2X.position(i)),
            x4: core::array::from_fn(|i| PATTERN_4X.position(i)),
            x8: core::array::from_fn(|i| PATTERN_8X.position(i)),
        }
    }

    /// Positions for `samples`, if it is a supported count
    pub fn get(&self, samples: u32) -> Option<&[[f32; 2]]> {
        match samples {
            1 => Some(&self.x1),
            2 => Some(&self.x2),
            4 => Some(&self.x4),
            8 => Some(&self.x8),
            _ => None,
        }
    }
}

impl Default for SamplePositions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_sreg_masks_negative_values() {
        assert_eq!(fill_sreg([4, 4, -4, -4, 0, 0, 0, 0]), 0x0000_CC44);
        assert_eq!(fill_sreg([-1, 0, 0, 0, 0, 0, 0, 0]), 0xF);
    }

    #[test]
    fn test_center_sample() {
        assert_eq!(PATTERN_1X.position(0), [0.5, 0.5]);
    }

    #[test]
    fn test_2x_positions() {
        let positions = SamplePositions::new();
        assert_eq!(positions.x2[0], [0.75, 0.75]);
        assert_eq!(positions.x2[1], [0.25, 0.25]);
    }

    #[test]
    fn test_8x_spans_two_registers() {
        let positions = SamplePositions::new();
        assert_eq!(positions.x8[0], [9.0 / 16.0, 5.0 / 16.0]);
        assert_eq!(positions.x8[4], [3.0 / 16.0, 13.0 / 16.0]);
        assert_eq!(positions.x8[7], [15.0 / 16.0, 1.0 / 16.0]);
    }

    #[test]
    fn test_positions_stay_inside_pixel() {
        let positions = SamplePositions::new();
        for samples in [1, 2, 4, 8] {
            for p in positions.get(samples).unwrap_or(&[]) {
                assert!((0.0..1.0).contains(&p[0]) && (0.0..1.0).contains(&p[1]));
            }
        }
        assert!(positions.get(16).is_none());
    }

    #[test]
    fn test_max_dist_and_fallback() {
        assert_eq!(default_max_sample_dist(0), 0);
        assert_eq!(default_max_sample_dist(2), 6);
        assert_eq!(default_max_sample_dist(3), 7);
        assert_eq!(default_pattern(3), &PATTERN_1X);
        assert_eq!(default_pattern(8).centroid_priority, 0x7654_3210_7654_3210);
    }
}
