//! # Graphics Preamble
//!
//! A short PM4 stream every graphics submission starts with: context control,
//! CLEAR_STATE, and the default single-sample locations. It is built once per
//! device and kept in a read-only write-combined BO.
//!
//! ```text
//! PKT3 header: [31:30] type=3 | [29:16] count | [15:8] opcode | [0] predicate
//! ```

use ember_surface::msaa::{SamplePattern, default_pattern};
use ember_surface::regs::pa_sc;
use ember_winsys::{Bo, BoCreateInfo, BoDomain, BoFlags, BoPriority};

use crate::device::Device;
use crate::memory::CpuMapping;
use crate::report::BoundObject;

// =============================================================================
// PM4
// =============================================================================

/// PM4 type-3 opcodes used by the preamble
pub mod opcode {
    /// Padding
    pub const NOP: u32 = 0x10;
    /// Reset context registers to their CLEAR_STATE values
    pub const CLEAR_STATE: u32 = 0x12;
    /// Shadowing and load control
    pub const CONTEXT_CONTROL: u32 = 0x28;
    /// Write dwords to memory or registers
    pub const WRITE_DATA: u32 = 0x37;
    /// Write consecutive context registers
    pub const SET_CONTEXT_REG: u32 = 0x69;
}

/// First context register
pub const CONTEXT_REG_OFFSET: u32 = 0x0002_8000;

/// GFX6 pads with type-2 packets
pub const PKT2_NOP_PAD: u32 = 0x8000_0000;
/// One-dword type-3 NOP
pub const PKT3_NOP_PAD: u32 = 0xFFFF_1000;

const CC0_UPDATE_LOAD_ENABLES: u32 = 1 << 31;
const CC1_UPDATE_SHADOW_ENABLES: u32 = 1 << 31;

/// Type-3 packet header; `count` is the payload length minus one
#[inline]
pub const fn pkt3(op: u32, count: u32, predicate: bool) -> u32 {
    (3 << 30) | ((count & 0x3FFF) << 16) | ((op & 0xFF) << 8) | predicate as u32
}

/// Growable dword stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CmdStream {
    buf: Vec<u32>,
}

impl CmdStream {
    /// Empty stream
    pub fn new() -> Self {
        Self::default()
    }

    /// Dwords written so far
    pub fn cdw(&self) -> usize {
        self.buf.len()
    }

    /// The stream
    pub fn as_slice(&self) -> &[u32] {
        &self.buf
    }

    /// Append one dword
    pub fn emit(&mut self, dw: u32) {
        self.buf.push(dw);
    }

    /// Start a run of `count` consecutive context registers at `reg`
    pub fn set_context_reg_seq(&mut self, reg: u32, count: u32) {
        debug_assert!(reg >= CONTEXT_REG_OFFSET);
        self.emit(pkt3(opcode::SET_CONTEXT_REG, count, false));
        self.emit((reg - CONTEXT_REG_OFFSET) >> 2);
    }

    /// Write one context register
    pub fn set_context_reg(&mut self, reg: u32, value: u32) {
        self.set_context_reg_seq(reg, 1);
        self.emit(value);
    }

    /// Pad to a multiple of 8 dwords
    pub fn pad(&mut self, type2: bool) {
        let nop = if type2 { PKT2_NOP_PAD } else { PKT3_NOP_PAD };
        while self.buf.len() % 8 != 0 {
            self.emit(nop);
        }
    }
}

/// Sample locations and centroid priority of a default pattern
///
/// Up to 4x only the first location register of each pixel quadrant is
/// programmed.
pub fn emit_default_sample_locations(cs: &mut CmdStream, pattern: &SamplePattern) {
    cs.set_context_reg_seq(pa_sc::CENTROID_PRIORITY_0, 2);
    cs.emit(pattern.centroid_priority as u32);
    cs.emit((pattern.centroid_priority >> 32) as u32);

    let locs = pattern.locs[0];
    cs.set_context_reg(pa_sc::AA_SAMPLE_LOCS_PIXEL_X0Y0_0, locs);
    cs.set_context_reg(pa_sc::AA_SAMPLE_LOCS_PIXEL_X1Y0_0, locs);
    cs.set_context_reg(pa_sc::AA_SAMPLE_LOCS_PIXEL_X0Y1_0, locs);
    cs.set_context_reg(pa_sc::AA_SAMPLE_LOCS_PIXEL_X1Y1_0, locs);
}

/// Build the preamble stream, padded for the chip
pub fn build_gfx_preamble(pad_with_type2: bool) -> CmdStream {
    let mut cs = CmdStream::new();

    cs.emit(pkt3(opcode::CONTEXT_CONTROL, 1, false));
    cs.emit(CC0_UPDATE_LOAD_ENABLES);
    cs.emit(CC1_UPDATE_SHADOW_ENABLES);

    cs.emit(pkt3(opcode::CLEAR_STATE, 0, false));
    cs.emit(0);

    emit_default_sample_locations(&mut cs, default_pattern(1));

    cs.pad(pad_with_type2);
    cs
}

// =============================================================================
// DEVICE
// =============================================================================

/// Uploaded preamble
#[derive(Debug)]
pub(crate) struct GfxPreamble {
    pub(crate) bo: Bo,
    pub(crate) size_dw: usize,
}

impl Device {
    /// Upload the preamble; any failure just leaves the device without one
    pub(crate) fn create_gfx_preamble(&self) -> Option<GfxPreamble> {
        let cs = build_gfx_preamble(self.physical.info().gfx_ib_pad_with_type2);
        let bytes: &[u8] = bytemuck::cast_slice(cs.as_slice());

        let info = BoCreateInfo::new(
            bytes.len() as u64,
            4096,
            BoDomain::GTT,
            BoFlags::CPU_ACCESS
                | BoFlags::NO_INTERPROCESS_SHARING
                | BoFlags::READ_ONLY
                | BoFlags::GTT_WC,
        )
        .with_priority(BoPriority::CS);
        let bo = match self.bo_create(&info, BoundObject::Device, true) {
            Ok(bo) => bo,
            Err(err) => {
                log::debug!("no graphics preamble: {err:?}");
                return None;
            }
        };

        let Some(mapping) = CpuMapping::map(self.ws.as_ref(), &bo) else {
            self.bo_destroy(BoundObject::Device, bo);
            return None;
        };
        mapping.write(0, bytes);
        drop(mapping);
        self.ws.buffer_unmap(&bo);

        Some(GfxPreamble {
            bo,
            size_dw: cs.cdw(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkt3_header() {
        assert_eq!(pkt3(opcode::SET_CONTEXT_REG, 1, false), 0xC001_6900);
        assert_eq!(pkt3(opcode::CLEAR_STATE, 0, false), 0xC000_1200);
        assert_eq!(pkt3(opcode::NOP, 0x3FFF, false), 0xFFFF_1000);
    }

    #[test]
    fn test_context_reg_offset() {
        let mut cs = CmdStream::new();
        cs.set_context_reg(pa_sc::AA_SAMPLE_LOCS_PIXEL_X0Y0_0, 7);
        assert_eq!(cs.as_slice(), &[0xC001_6900, (0x028BF8 - 0x28000) >> 2, 7]);
    }

    #[test]
    fn test_preamble_layout_and_padding() {
        let cs = build_gfx_preamble(false);
        // 3 + 2 + 4 (centroid) + 4 * 3 (locations) = 21, padded to 24.
        assert_eq!(cs.cdw(), 24);
        let dw = cs.as_slice();
        assert_eq!(dw[0], pkt3(opcode::CONTEXT_CONTROL, 1, false));
        assert_eq!(dw[3], pkt3(opcode::CLEAR_STATE, 0, false));
        assert_eq!(dw[5], pkt3(opcode::SET_CONTEXT_REG, 2, false));
        assert_eq!(&dw[21..], &[PKT3_NOP_PAD; 3]);

        let gfx6 = build_gfx_preamble(true);
        assert_eq!(&gfx6.as_slice()[21..], &[PKT2_NOP_PAD; 3]);
    }
}
