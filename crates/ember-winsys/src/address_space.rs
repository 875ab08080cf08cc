//! # GPU Virtual Address Space
//!
//! First-fit virtual address allocator with support for fixed-address
//! requests (capture replay) and free-block coalescing.

use alloc::vec;
use alloc::vec::Vec;

use ember_core::{ByteSize, Error, GpuAddr, Result, align_up};

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A half-open range in GPU virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    /// Start address
    pub start: GpuAddr,
    /// End address (exclusive)
    pub end: GpuAddr,
}

impl VaRange {
    /// Create a range of `size` bytes starting at `start`
    pub const fn new(start: GpuAddr, size: u64) -> Self {
        Self {
            start,
            end: GpuAddr::new(start.raw() + size),
        }
    }

    /// Range size in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Whether `other` lies entirely inside this range
    pub fn covers(&self, other: &VaRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Check if ranges overlap
    pub fn overlaps(&self, other: &VaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// VA BLOCK
// =============================================================================

#[derive(Debug, Clone)]
struct VaBlock {
    range: VaRange,
    free: bool,
}

// =============================================================================
// ADDRESS SPACE
// =============================================================================

/// GPU virtual address space
#[derive(Debug)]
pub struct AddressSpace {
    range: VaRange,
    blocks: Vec<VaBlock>,
    stats: AddressSpaceStats,
}

/// Address space statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSpaceStats {
    /// Number of allocations
    pub allocs: u64,
    /// Number of frees
    pub frees: u64,
    /// Current allocated bytes
    pub allocated: u64,
}

/// Minimum VA granularity
pub const VA_PAGE_SIZE: u64 = 4096;

impl AddressSpace {
    /// Create an address space managing `range`
    pub fn new(range: VaRange) -> Self {
        Self {
            range,
            blocks: vec![VaBlock { range, free: true }],
            stats: AddressSpaceStats::default(),
        }
    }

    /// Managed range
    pub fn range(&self) -> VaRange {
        self.range
    }

    /// Allocate `size` bytes at the first suitably aligned free address
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<VaRange> {
        let size = align_up(size.max(1), VA_PAGE_SIZE);
        let alignment = alignment.max(VA_PAGE_SIZE);

        let found = self.blocks.iter().enumerate().find_map(|(i, block)| {
            if !block.free {
                return None;
            }
            let start = align_up(block.range.start.raw(), alignment);
            let candidate = VaRange::new(GpuAddr::new(start), size);
            block.range.covers(&candidate).then_some((i, candidate))
        });

        let (index, range) = found.ok_or(Error::OutOfAddressSpace)?;
        self.split_block(index, range);
        Ok(range)
    }

    /// Allocate exactly `[address, address + size)`
    pub fn allocate_at(&mut self, address: GpuAddr, size: u64) -> Result<VaRange> {
        if !address.is_aligned(VA_PAGE_SIZE) {
            return Err(Error::MisalignedAddress);
        }
        let range = VaRange::new(address, align_up(size.max(1), VA_PAGE_SIZE));
        let index = self
            .blocks
            .iter()
            .position(|b| b.free && b.range.covers(&range))
            .ok_or(Error::OutOfAddressSpace)?;
        self.split_block(index, range);
        Ok(range)
    }

    fn split_block(&mut self, index: usize, alloc: VaRange) {
        let block = self.blocks.remove(index);
        let mut at = index;

        if alloc.start > block.range.start {
            self.blocks.insert(at, VaBlock {
                range: VaRange {
                    start: block.range.start,
                    end: alloc.start,
                },
                free: true,
            });
            at += 1;
        }

        self.blocks.insert(at, VaBlock {
            range: alloc,
            free: false,
        });

        if alloc.end < block.range.end {
            self.blocks.insert(at + 1, VaBlock {
                range: VaRange {
                    start: alloc.end,
                    end: block.range.end,
                },
                free: true,
            });
        }

        self.stats.allocs += 1;
        self.stats.allocated += alloc.size();
    }

    /// Release a range returned by [`AddressSpace::allocate`]
    pub fn free(&mut self, range: VaRange) -> Result<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.range == range && !b.free)
            .ok_or(Error::NotFound)?;

        self.blocks[index].free = true;
        self.stats.frees += 1;
        self.stats.allocated -= range.size();
        self.merge_free_blocks();
        Ok(())
    }

    fn merge_free_blocks(&mut self) {
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                self.blocks[i].range.end = self.blocks[i + 1].range.end;
                self.blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Statistics
    pub fn stats(&self) -> &AddressSpaceStats {
        &self.stats
    }

    /// Total free bytes
    pub fn free_space(&self) -> ByteSize {
        ByteSize::from_bytes(
            self.blocks
                .iter()
                .filter(|b| b.free)
                .map(|b| b.range.size())
                .sum(),
        )
    }

    /// Number of blocks, free or allocated
    pub fn fragment_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(VaRange::new(GpuAddr::new(0x10_0000), 0x100_0000))
    }

    #[test]
    fn test_allocate_and_free_coalesces() {
        let mut va = space();
        let before = va.free_space();
        let a = va.allocate(4096, 4096).unwrap();
        let b = va.allocate(8192, 65536).unwrap();
        assert!(b.start.is_aligned(65536));
        assert!(!a.overlaps(&b));

        va.free(a).unwrap();
        va.free(b).unwrap();
        assert_eq!(va.free_space(), before);
        assert_eq!(va.fragment_count(), 1);
    }

    #[test]
    fn test_allocate_at_fixed_address() {
        let mut va = space();
        let fixed = va.allocate_at(GpuAddr::new(0x20_0000), 4096).unwrap();
        assert_eq!(fixed.start.raw(), 0x20_0000);
        assert_eq!(
            va.allocate_at(GpuAddr::new(0x20_0000), 4096),
            Err(Error::OutOfAddressSpace)
        );
        assert_eq!(
            va.allocate_at(GpuAddr::new(0x20_0001), 4096),
            Err(Error::MisalignedAddress)
        );
    }

    #[test]
    fn test_exhaustion() {
        let mut va = space();
        assert_eq!(va.allocate(0x200_0000, 4096), Err(Error::OutOfAddressSpace));
    }

    #[test]
    fn test_double_free_rejected() {
        let mut va = space();
        let a = va.allocate(4096, 4096).unwrap();
        va.free(a).unwrap();
        assert_eq!(va.free(a), Err(Error::NotFound));
    }
}
