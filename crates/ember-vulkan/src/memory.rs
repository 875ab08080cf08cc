//! # Device Memory
//!
//! `VkDeviceMemory` objects, external memory queries and the BO helpers
//! every driver-owned allocation goes through.
//!
//! ```text
//! allocate_memory ──► bo_create ──► Winsys::buffer_create
//!                         │
//!                         ├── memory trace: BoAllocate
//!                         └── address binding report: Bind
//! ```

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use ember_core::{Handle, align_up};
use ember_winsys::{Bo, BoCreateInfo, BoDomain, BoFlags, BoPriority, Winsys};

use crate::device::Device;
use crate::report::{AddressBindingKind, BoundObject, MemoryHandle};
use crate::result::{Result, VkError};
use crate::trace::MemoryTraceToken;

// =============================================================================
// CPU MAPPING
// =============================================================================

/// CPU view of a mapped BO
///
/// Valid until the BO is unmapped or destroyed; the owner of the BO keeps the
/// mapping next to it and drops both together.
pub(crate) struct CpuMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory owned by the backend for the lifetime
// of the BO. Writers serialize through the lock of the owning subsystem.
unsafe impl Send for CpuMapping {}
// SAFETY: see above.
unsafe impl Sync for CpuMapping {}

impl CpuMapping {
    /// Map `bo`; `None` when the backend refuses
    pub(crate) fn map(ws: &dyn Winsys, bo: &Bo) -> Option<Self> {
        let ptr = ws.buffer_map(bo)?;
        let len = usize::try_from(bo.size()).ok()?;
        Some(Self { ptr, len })
    }

    /// Copy `bytes` to `offset`; out-of-range writes are dropped
    pub(crate) fn write(&self, offset: usize, bytes: &[u8]) -> bool {
        let Some(end) = offset.checked_add(bytes.len()) else {
            return false;
        };
        if end > self.len {
            return false;
        }
        // SAFETY: `offset..end` lies inside the mapping, which stays valid
        // while `self` lives, and `bytes` cannot alias device memory.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
        true
    }

    /// Mapped length in bytes
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl core::fmt::Debug for CpuMapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuMapping").field("len", &self.len).finish()
    }
}

/// A BO kept CPU-mapped (and optionally resident) for its whole lifetime
#[derive(Debug)]
pub(crate) struct MappedBo {
    pub(crate) bo: Bo,
    pub(crate) mapping: CpuMapping,
    resident: bool,
}

impl MappedBo {
    /// Create, optionally make resident, then map
    ///
    /// Every failure undoes the earlier steps and reports device memory
    /// exhaustion; callers with stricter contracts remap the error.
    pub(crate) fn create(ws: &dyn Winsys, info: &BoCreateInfo, resident: bool) -> Result<Self> {
        let bo = ws
            .buffer_create(info)
            .map_err(|_| VkError::OutOfDeviceMemory)?;

        if resident && ws.buffer_make_resident(&bo, true).is_err() {
            ws.buffer_destroy(bo);
            return Err(VkError::OutOfDeviceMemory);
        }

        let Some(mapping) = CpuMapping::map(ws, &bo) else {
            if resident && ws.buffer_make_resident(&bo, false).is_err() {
                log::warn!("failed to evict {:?} after a map failure", bo.handle());
            }
            ws.buffer_destroy(bo);
            return Err(VkError::OutOfDeviceMemory);
        };

        Ok(Self {
            bo,
            mapping,
            resident,
        })
    }

    /// Base virtual address
    pub(crate) fn va(&self) -> u64 {
        self.bo.va().raw()
    }

    /// Unmap, evict and free
    pub(crate) fn destroy(self, ws: &dyn Winsys) {
        let Self { bo, mapping, resident } = self;
        drop(mapping);
        ws.buffer_unmap(&bo);
        if resident && ws.buffer_make_resident(&bo, false).is_err() {
            log::warn!("failed to evict {:?}", bo.handle());
        }
        ws.buffer_destroy(bo);
    }
}

// =============================================================================
// DEVICE MEMORY
// =============================================================================

/// External memory handle types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExternalMemoryHandleType {
    /// Opaque POSIX fd
    OpaqueFd,
    /// Linux dma-buf fd
    DmaBuf,
    /// Host allocation imported by pointer
    HostAllocation,
    /// Foreign memory mapped into the host address space
    HostMappedForeignMemory,
}

/// Parameters of [`Device::allocate_memory`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryAllocateInfo {
    /// Size in bytes
    pub allocation_size: u64,
    /// Index into the physical device memory types
    pub memory_type_index: u32,
    /// May be exported to other processes
    pub exportable: bool,
}

impl MemoryAllocateInfo {
    /// Private allocation of `allocation_size` bytes
    pub const fn new(allocation_size: u64, memory_type_index: u32) -> Self {
        Self {
            allocation_size,
            memory_type_index,
            exportable: false,
        }
    }
}

/// A `VkDeviceMemory`
#[derive(Debug)]
pub struct DeviceMemory {
    handle: MemoryHandle,
    bo: Bo,
    alloc_size: u64,
    memory_type_index: u32,
    heap_index: u32,
}

impl DeviceMemory {
    /// API handle
    pub fn handle(&self) -> MemoryHandle {
        self.handle
    }

    /// Backing BO
    pub fn bo(&self) -> &Bo {
        &self.bo
    }

    /// Requested size, 0 when unknown (imported memory)
    pub fn alloc_size(&self) -> u64 {
        self.alloc_size
    }

    /// Memory type index
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }
}

impl Device {
    // =========================================================================
    // BO helpers
    // =========================================================================

    /// Create a BO and announce it to the memory trace and debug callback
    pub(crate) fn bo_create(
        &self,
        info: &BoCreateInfo,
        object: BoundObject,
        internal: bool,
    ) -> Result<Bo> {
        let bo = self.ws.buffer_create(info)?;
        self.log_memory_trace(MemoryTraceToken::BoAllocate {
            va: bo.va().raw(),
            size: bo.size(),
            internal,
        });
        self.report_address_binding(object, bo.va().raw(), bo.size(), AddressBindingKind::Bind);
        Ok(bo)
    }

    /// Destroy a BO created with [`Device::bo_create`]
    pub(crate) fn bo_destroy(&self, object: BoundObject, bo: Bo) {
        self.log_memory_trace(MemoryTraceToken::BoDestroy { va: bo.va().raw() });
        self.report_address_binding(object, bo.va().raw(), bo.size(), AddressBindingKind::Unbind);
        self.ws.buffer_destroy(bo);
    }

    pub(crate) fn next_object_id(&self) -> u64 {
        self.object_ids.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate device memory
    ///
    /// With overallocation disallowed the request fails once the heap's
    /// tracked usage would exceed its size.
    pub fn allocate_memory(&self, info: &MemoryAllocateInfo) -> Result<DeviceMemory> {
        let props = self.physical.memory_properties();
        let mem_type = *props
            .memory_types
            .get(info.memory_type_index as usize)
            .ok_or(VkError::Unknown)?;
        if info.allocation_size == 0 {
            return Err(VkError::Unknown);
        }

        let heap_index = mem_type.heap_index;
        let size = align_up(info.allocation_size, 4096);

        if self.state.overallocation_disallowed {
            let heap_size = props.memory_heaps[heap_index as usize].size;
            let mut usage = self.heap_usage.lock();
            let used = &mut usage[heap_index as usize];
            if used.saturating_add(size) > heap_size {
                return Err(VkError::OutOfDeviceMemory);
            }
            *used += size;
        }

        let mut flags = mem_type.flags;
        if !info.exportable {
            flags |= BoFlags::NO_INTERPROCESS_SHARING;
        }

        let handle: MemoryHandle = Handle::new(self.next_object_id());
        let bo_info =
            BoCreateInfo::new(size, 4096, mem_type.domain, flags).with_priority(BoPriority::APPLICATION);
        let bo = match self.bo_create(&bo_info, BoundObject::Memory(handle), false) {
            Ok(bo) => bo,
            Err(_) => {
                self.release_heap_usage(heap_index, size);
                return Err(VkError::OutOfDeviceMemory);
            }
        };

        self.log_memory_trace(MemoryTraceToken::HeapCreate {
            memory: handle.id(),
            va: bo.va().raw(),
            size: bo.size(),
        });

        Ok(DeviceMemory {
            handle,
            bo,
            alloc_size: info.allocation_size,
            memory_type_index: info.memory_type_index,
            heap_index,
        })
    }

    /// Free device memory; `None` is a no-op
    pub fn free_memory(&self, memory: Option<DeviceMemory>) {
        let Some(memory) = memory else {
            return;
        };
        if memory.alloc_size != 0 {
            self.release_heap_usage(memory.heap_index, align_up(memory.alloc_size, 4096));
        }
        self.log_memory_trace(MemoryTraceToken::ResourceDestroy {
            object: memory.handle.id(),
        });
        self.bo_destroy(BoundObject::Memory(memory.handle), memory.bo);
    }

    fn release_heap_usage(&self, heap_index: u32, size: u64) {
        if self.state.overallocation_disallowed {
            let mut usage = self.heap_usage.lock();
            let used = &mut usage[heap_index as usize];
            *used = used.saturating_sub(size);
        }
    }

    /// Import a dma-buf as device memory of `memory_type_index`
    ///
    /// The imported size is owned by the exporter, so `alloc_size` is 0 and
    /// binds against it are not size checked.
    pub fn import_memory_fd(&self, fd: i32, memory_type_index: u32) -> Result<DeviceMemory> {
        let mem_type = *self
            .physical
            .memory_properties()
            .memory_types
            .get(memory_type_index as usize)
            .ok_or(VkError::InvalidExternalHandle)?;

        let bo = self
            .ws
            .buffer_from_fd(fd, BoPriority::APPLICATION)
            .map_err(|_| VkError::InvalidExternalHandle)?;

        let handle: MemoryHandle = Handle::new(self.next_object_id());
        self.log_memory_trace(MemoryTraceToken::BoAllocate {
            va: bo.va().raw(),
            size: bo.size(),
            internal: false,
        });
        self.report_address_binding(
            BoundObject::Memory(handle),
            bo.va().raw(),
            bo.size(),
            AddressBindingKind::Bind,
        );

        Ok(DeviceMemory {
            handle,
            bo,
            alloc_size: 0,
            memory_type_index,
            heap_index: mem_type.heap_index,
        })
    }

    // =========================================================================
    // External memory queries
    // =========================================================================

    /// Export memory as a dma-buf fd
    pub fn get_memory_fd(&self, memory: &DeviceMemory) -> Result<i32> {
        self.ws
            .buffer_get_fd(&memory.bo)
            .map_err(|_| VkError::OutOfDeviceMemory)
    }

    /// Memory types an fd of `handle_type` can be imported as
    pub fn memory_fd_properties(
        &self,
        handle_type: ExternalMemoryHandleType,
        fd: i32,
    ) -> Result<u32> {
        match handle_type {
            ExternalMemoryHandleType::DmaBuf => {
                let (domain, flags) = self
                    .ws
                    .buffer_get_flags_from_fd(fd)
                    .ok_or(VkError::InvalidExternalHandle)?;
                Ok(self.physical.compute_valid_memory_types(domain, flags))
            }
            _ => Err(VkError::InvalidExternalHandle),
        }
    }

    /// Memory types a host pointer of `handle_type` can be imported as
    ///
    /// Host memory is only importable as cached GTT; a device without such a
    /// type reports no bits rather than failing.
    pub fn memory_host_pointer_properties(
        &self,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<u32> {
        match handle_type {
            ExternalMemoryHandleType::HostAllocation => Ok(self
                .physical
                .memory_properties()
                .memory_types
                .iter()
                .position(|t| t.domain == BoDomain::GTT && !t.flags.contains(BoFlags::GTT_WC))
                .map_or(0, |i| 1 << i)),
            _ => Err(VkError::InvalidExternalHandle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_winsys::NullWinsys;

    #[test]
    fn test_mapping_writes_reach_the_bo() {
        let ws = NullWinsys::new();
        let bo = ws
            .buffer_create(&BoCreateInfo::new(64, 4096, BoDomain::GTT, BoFlags::CPU_ACCESS))
            .unwrap();
        let mapping = CpuMapping::map(&ws, &bo).unwrap();
        assert_eq!(mapping.len(), 64);
        assert!(mapping.write(4, &[1, 2, 3]));
        assert!(!mapping.write(62, &[0; 4]));
        assert!(!mapping.write(usize::MAX, &[0]));

        let contents = ws.bo_contents(bo.handle()).unwrap();
        assert_eq!(&contents[..8], &[0, 0, 0, 0, 1, 2, 3, 0]);
        ws.buffer_destroy(bo);
    }

    #[test]
    fn test_invisible_bo_does_not_map() {
        let ws = NullWinsys::new();
        let bo = ws
            .buffer_create(&BoCreateInfo::new(64, 4096, BoDomain::VRAM, BoFlags::NO_CPU_ACCESS))
            .unwrap();
        assert!(CpuMapping::map(&ws, &bo).is_none());
        ws.buffer_destroy(bo);
    }
}
