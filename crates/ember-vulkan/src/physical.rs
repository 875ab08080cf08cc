//! # Physical Device
//!
//! What a GPU offers before a logical device exists: memory types and heaps,
//! queue families, and the chip description from the kernel.
//!
//! ## Memory types
//!
//! ```text
//! idx  domain  backend flags             properties
//! 0    VRAM    NO_CPU_ACCESS             DEVICE_LOCAL
//! 1    GTT     GTT_WC                    HOST_VISIBLE | HOST_COHERENT
//! 2    VRAM    CPU_ACCESS                DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT
//! 3    GTT     -                         HOST_VISIBLE | HOST_COHERENT | HOST_CACHED
//! 4    VRAM    NO_CPU_ACCESS | ADDR_32BIT DEVICE_LOCAL   (32-bit addressable)
//! ```

use std::sync::Arc;

use arrayvec::ArrayVec;
use ember_core::{ChipInfo, GfxLevel};
use ember_winsys::{BoDomain, BoFlags, Winsys};

use crate::config::{DriverConfig, PerftestFlags};
use crate::shader_part::{PassthroughCompiler, ShaderCompiler};

// =============================================================================
// QUEUE FAMILIES
// =============================================================================

bitflags::bitflags! {
    /// Queue capability flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VkQueueFlags: u32 {
        /// Graphics queue
        const GRAPHICS = 1 << 0;
        /// Compute queue
        const COMPUTE = 1 << 1;
        /// Transfer queue
        const TRANSFER = 1 << 2;
        /// Sparse binding queue
        const SPARSE_BINDING = 1 << 3;
    }
}

/// Hardware engine behind a queue family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueFamily {
    /// Graphics + compute ring
    General,
    /// Asynchronous compute ring
    Compute,
    /// SDMA engine
    Transfer,
}

/// Queue family properties
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VkQueueFamilyProperties {
    /// Engine
    pub family: QueueFamily,
    /// Queue flags
    pub queue_flags: VkQueueFlags,
    /// Queue count
    pub queue_count: u32,
    /// Timestamp valid bits
    pub timestamp_valid_bits: u32,
}

/// Maximum queue families
pub const MAX_QUEUE_FAMILIES: usize = 4;

// =============================================================================
// MEMORY
// =============================================================================

bitflags::bitflags! {
    /// Memory property flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct VkMemoryPropertyFlags: u32 {
        /// Device local memory
        const DEVICE_LOCAL = 1 << 0;
        /// Host visible memory
        const HOST_VISIBLE = 1 << 1;
        /// Host coherent memory
        const HOST_COHERENT = 1 << 2;
        /// Host cached memory
        const HOST_CACHED = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Memory heap flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct VkMemoryHeapFlags: u32 {
        /// Device local heap
        const DEVICE_LOCAL = 1 << 0;
    }
}

/// Memory type, with the backend placement it maps to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VkMemoryType {
    /// Property flags
    pub property_flags: VkMemoryPropertyFlags,
    /// Heap index
    pub heap_index: u32,
    /// Backend domain
    pub domain: BoDomain,
    /// Backend creation flags
    pub flags: BoFlags,
}

/// Memory heap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VkMemoryHeap {
    /// Heap size in bytes
    pub size: u64,
    /// Heap flags
    pub flags: VkMemoryHeapFlags,
}

/// Maximum memory types
pub const VK_MAX_MEMORY_TYPES: usize = 32;
/// Maximum memory heaps
pub const VK_MAX_MEMORY_HEAPS: usize = 16;

/// Physical device memory properties
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VkPhysicalDeviceMemoryProperties {
    /// Memory types
    pub memory_types: ArrayVec<VkMemoryType, VK_MAX_MEMORY_TYPES>,
    /// Memory heaps
    pub memory_heaps: ArrayVec<VkMemoryHeap, VK_MAX_MEMORY_HEAPS>,
}

impl VkPhysicalDeviceMemoryProperties {
    /// Bitmask with one bit per memory type
    pub fn all_types_mask(&self) -> u32 {
        bit_mask(self.memory_types.len() as u32)
    }
}

fn bit_mask(count: u32) -> u32 {
    if count >= 32 { u32::MAX } else { (1u32 << count) - 1 }
}

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

// =============================================================================
// PHYSICAL DEVICE
// =============================================================================

/// Number of performance counter blocks described for counter-capable chips
const PERF_COUNTER_BLOCKS: u32 = 12;

/// A GPU as enumerated by the instance
pub struct PhysicalDevice {
    ws: Arc<dyn Winsys>,
    info: ChipInfo,
    compiler: Arc<dyn ShaderCompiler>,
    memory_properties: VkPhysicalDeviceMemoryProperties,
    memory_types_32bit: u32,
    queue_families: ArrayVec<VkQueueFamilyProperties, MAX_QUEUE_FAMILIES>,
    use_ngg: bool,
    ge_wave_size: u32,
}

impl PhysicalDevice {
    /// Describe the GPU behind `ws`
    pub fn new(ws: Arc<dyn Winsys>, info: ChipInfo) -> Self {
        let vram_size = if info.has_dedicated_vram { 8 * GIB } else { 512 * MIB };
        let visible_vram_size = if info.has_dedicated_vram { 256 * MIB } else { vram_size };

        let mut memory_properties = VkPhysicalDeviceMemoryProperties::default();
        memory_properties.memory_heaps.push(VkMemoryHeap {
            size: vram_size,
            flags: VkMemoryHeapFlags::DEVICE_LOCAL,
        });
        memory_properties.memory_heaps.push(VkMemoryHeap {
            size: 16 * GIB,
            flags: VkMemoryHeapFlags::empty(),
        });
        memory_properties.memory_heaps.push(VkMemoryHeap {
            size: visible_vram_size,
            flags: VkMemoryHeapFlags::DEVICE_LOCAL,
        });

        let host = VkMemoryPropertyFlags::HOST_VISIBLE | VkMemoryPropertyFlags::HOST_COHERENT;
        memory_properties.memory_types.push(VkMemoryType {
            property_flags: VkMemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
            domain: BoDomain::VRAM,
            flags: BoFlags::NO_CPU_ACCESS,
        });
        memory_properties.memory_types.push(VkMemoryType {
            property_flags: host,
            heap_index: 1,
            domain: BoDomain::GTT,
            flags: BoFlags::GTT_WC,
        });
        memory_properties.memory_types.push(VkMemoryType {
            property_flags: VkMemoryPropertyFlags::DEVICE_LOCAL | host,
            heap_index: 2,
            domain: BoDomain::VRAM,
            flags: BoFlags::CPU_ACCESS,
        });
        memory_properties.memory_types.push(VkMemoryType {
            property_flags: host | VkMemoryPropertyFlags::HOST_CACHED,
            heap_index: 1,
            domain: BoDomain::GTT,
            flags: BoFlags::empty(),
        });
        memory_properties.memory_types.push(VkMemoryType {
            property_flags: VkMemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
            domain: BoDomain::VRAM,
            flags: BoFlags::NO_CPU_ACCESS | BoFlags::ADDR_32BIT,
        });

        let memory_types_32bit = memory_properties
            .memory_types
            .iter()
            .enumerate()
            .filter(|(_, t)| t.flags.contains(BoFlags::ADDR_32BIT))
            .fold(0u32, |mask, (i, _)| mask | (1 << i));

        let mut queue_families = ArrayVec::new();
        queue_families.push(VkQueueFamilyProperties {
            family: QueueFamily::General,
            queue_flags: VkQueueFlags::GRAPHICS
                | VkQueueFlags::COMPUTE
                | VkQueueFlags::TRANSFER
                | VkQueueFlags::SPARSE_BINDING,
            queue_count: 1,
            timestamp_valid_bits: 64,
        });
        queue_families.push(VkQueueFamilyProperties {
            family: QueueFamily::Compute,
            queue_flags: VkQueueFlags::COMPUTE
                | VkQueueFlags::TRANSFER
                | VkQueueFlags::SPARSE_BINDING,
            queue_count: 4,
            timestamp_valid_bits: 64,
        });
        if info.gfx_level >= GfxLevel::Gfx9 {
            queue_families.push(VkQueueFamilyProperties {
                family: QueueFamily::Transfer,
                queue_flags: VkQueueFlags::TRANSFER,
                queue_count: 1,
                timestamp_valid_bits: 64,
            });
        }

        let use_ngg = info.gfx_level >= GfxLevel::Gfx10;
        let ge_wave_size = if info.gfx_level >= GfxLevel::Gfx10 { 32 } else { 64 };

        Self {
            ws,
            info,
            compiler: Arc::new(PassthroughCompiler),
            memory_properties,
            memory_types_32bit,
            queue_families,
            use_ngg,
            ge_wave_size,
        }
    }

    /// Use `compiler` for shader parts of devices created from now on
    pub fn with_compiler(mut self, compiler: Arc<dyn ShaderCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    /// Memory backend
    pub fn winsys(&self) -> &Arc<dyn Winsys> {
        &self.ws
    }

    /// Chip description
    pub fn info(&self) -> &ChipInfo {
        &self.info
    }

    /// Graphics generation
    pub fn gfx_level(&self) -> GfxLevel {
        self.info.gfx_level
    }

    /// Shader part compiler
    pub fn compiler(&self) -> &Arc<dyn ShaderCompiler> {
        &self.compiler
    }

    /// Memory types and heaps
    pub fn memory_properties(&self) -> &VkPhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Memory types whose addresses fit in 32 bits
    pub fn memory_types_32bit(&self) -> u32 {
        self.memory_types_32bit
    }

    /// Queue families
    pub fn queue_families(&self) -> &[VkQueueFamilyProperties] {
        &self.queue_families
    }

    /// Geometry runs on the NGG pipeline
    pub fn use_ngg(&self) -> bool {
        self.use_ngg
    }

    /// Wave size of the geometry engine
    pub fn ge_wave_size(&self) -> u32 {
        self.ge_wave_size
    }

    /// Ray tracing is exposed, natively or emulated
    pub fn rt_enabled(&self, config: &DriverConfig) -> bool {
        self.info.gfx_level >= GfxLevel::Gfx10_3
            || config.perftest.contains(PerftestFlags::RT_EMULATION)
    }

    /// Performance counter blocks the chip describes
    pub fn perf_counter_block_count(&self) -> u32 {
        if self.info.has_perf_counters { PERF_COUNTER_BLOCKS } else { 0 }
    }

    /// First memory type whose placement matches exactly
    pub fn find_memory_type(&self, domain: BoDomain, flags: BoFlags) -> Option<u32> {
        self.memory_properties
            .memory_types
            .iter()
            .position(|t| t.domain == domain && t.flags == flags)
            .map(|i| i as u32)
    }

    /// Memory types an allocation with this placement may be imported as
    ///
    /// Placement attributes that do not change device behaviour are relaxed
    /// step by step until something matches; 32-bit types are never offered
    /// for shared memory.
    pub fn compute_valid_memory_types(&self, domain: BoDomain, flags: BoFlags) -> u32 {
        let mut ignore_flags = !(BoFlags::NO_CPU_ACCESS | BoFlags::GTT_WC);
        let mut bits = self.valid_memory_types_attempt(domain, flags, ignore_flags);

        if bits == 0 {
            ignore_flags |= BoFlags::GTT_WC;
            bits = self.valid_memory_types_attempt(domain, flags, ignore_flags);
        }
        if bits == 0 {
            ignore_flags |= BoFlags::NO_CPU_ACCESS;
            bits = self.valid_memory_types_attempt(domain, flags, ignore_flags);
        }

        bits & !self.memory_types_32bit
    }

    fn valid_memory_types_attempt(
        &self,
        domain: BoDomain,
        flags: BoFlags,
        ignore_flags: BoFlags,
    ) -> u32 {
        // GTT placement is not tracked consistently and VRAM BOs sometimes
        // report VRAM|GTT, so only these domains count.
        let relevant = BoDomain::VRAM | BoDomain::GDS | BoDomain::OA;

        self.memory_properties
            .memory_types
            .iter()
            .enumerate()
            .filter(|(_, t)| (domain & relevant) == (t.domain & relevant))
            .filter(|(_, t)| (flags & !ignore_flags) == (t.flags & !ignore_flags))
            .fold(0u32, |bits, (i, _)| bits | (1 << i))
    }
}

impl core::fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalDevice")
            .field("family", &self.info.family)
            .field("gfx_level", &self.info.gfx_level)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(PhysicalDevice: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ChipFamily;
    use ember_winsys::NullWinsys;

    fn physical(family: ChipFamily) -> PhysicalDevice {
        PhysicalDevice::new(Arc::new(NullWinsys::new()), ChipInfo::for_family(family))
    }

    #[test]
    fn test_memory_layout() {
        let pdev = physical(ChipFamily::Navi21);
        let props = pdev.memory_properties();
        assert_eq!(props.memory_types.len(), 5);
        assert_eq!(props.all_types_mask(), 0b11111);
        assert_eq!(pdev.memory_types_32bit(), 1 << 4);
        assert_eq!(pdev.find_memory_type(BoDomain::GTT, BoFlags::empty()), Some(3));
    }

    #[test]
    fn test_valid_types_exact_match() {
        let pdev = physical(ChipFamily::Navi21);
        assert_eq!(
            pdev.compute_valid_memory_types(BoDomain::VRAM, BoFlags::NO_CPU_ACCESS),
            1 << 0
        );
        assert_eq!(
            pdev.compute_valid_memory_types(BoDomain::VRAM, BoFlags::CPU_ACCESS),
            1 << 2
        );
    }

    #[test]
    fn test_valid_types_relax_wc_then_cpu_access() {
        let pdev = physical(ChipFamily::Navi21);
        assert_eq!(
            pdev.compute_valid_memory_types(BoDomain::GTT, BoFlags::GTT_WC),
            1 << 1
        );
        // CPU_ACCESS is ignored from the start.
        assert_eq!(
            pdev.compute_valid_memory_types(BoDomain::GTT, BoFlags::CPU_ACCESS),
            1 << 3
        );
        // No VRAM type is both CPU-invisible and write-combined.
        assert_eq!(
            pdev.compute_valid_memory_types(
                BoDomain::VRAM,
                BoFlags::NO_CPU_ACCESS | BoFlags::GTT_WC
            ),
            1 << 0
        );
    }

    #[test]
    fn test_valid_types_never_32bit() {
        let pdev = physical(ChipFamily::Navi21);
        let bits = pdev.compute_valid_memory_types(
            BoDomain::VRAM,
            BoFlags::NO_CPU_ACCESS | BoFlags::ADDR_32BIT,
        );
        assert_eq!(bits & pdev.memory_types_32bit(), 0);
    }

    #[test]
    fn test_queue_families_by_generation() {
        assert_eq!(physical(ChipFamily::Polaris10).queue_families().len(), 2);
        assert_eq!(physical(ChipFamily::Navi31).queue_families().len(), 3);
    }

    #[test]
    fn test_rt_support() {
        let config = DriverConfig::default();
        assert!(physical(ChipFamily::Navi21).rt_enabled(&config));
        assert!(!physical(ChipFamily::Navi10).rt_enabled(&config));
        let emulated = DriverConfig {
            perftest: PerftestFlags::RT_EMULATION,
            ..DriverConfig::default()
        };
        assert!(physical(ChipFamily::Navi10).rt_enabled(&emulated));
    }
}
