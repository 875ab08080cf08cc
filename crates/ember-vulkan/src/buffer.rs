//! # Buffer Resource Manager
//!
//! `VkBuffer` objects: creation, destruction, memory binding, memory
//! requirements and device addresses.
//!
//! ```text
//!   create_buffer ──────────────► Buffer (unbound)
//!        │ sparse                     │
//!        ▼                            │ bind_buffer_memory
//!   virtual BO reserved               ▼
//!   (bind_sparse_buffer maps     Buffer (bound: BO, offset,
//!    pages into it)               bo_va, bo_size)
//!                                     │
//!                                     ▼ destroy_buffer
//!                              unbind report, trace token
//! ```
//!
//! A buffer never owns the memory it is bound to. It keeps a [`BoRef`] to the
//! allocation's BO and the address the bind was reported at.

use ember_core::{Handle, align_up};
use ember_surface::Image;
use ember_winsys::{Bo, BoCreateInfo, BoDomain, BoFlags, BoPriority, BoRef};

use crate::device::Device;
use crate::memory::DeviceMemory;
use crate::report::{AddressBindingKind, BoundObject, BufferHandle};
use crate::result::{Result, VkError, VkResult};
use crate::trace::MemoryTraceToken;

// =============================================================================
// FLAGS
// =============================================================================

bitflags::bitflags! {
    /// `VkBufferCreateFlags`
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BufferCreateFlags: u32 {
        /// Backed by page-granular sparse bindings
        const SPARSE_BINDING = 0x0000_0001;
        /// Sparse pages may be partially resident
        const SPARSE_RESIDENCY = 0x0000_0002;
        /// Sparse pages may alias
        const SPARSE_ALIASED = 0x0000_0004;
        /// Protected memory
        const PROTECTED = 0x0000_0008;
        /// Device address can be captured and replayed
        const DEVICE_ADDRESS_CAPTURE_REPLAY = 0x0000_0010;
    }
}

bitflags::bitflags! {
    /// `VkBufferUsageFlags2KHR`
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsageFlags: u64 {
        /// Copy source
        const TRANSFER_SRC = 0x0000_0001;
        /// Copy destination
        const TRANSFER_DST = 0x0000_0002;
        /// Uniform texel buffer
        const UNIFORM_TEXEL_BUFFER = 0x0000_0004;
        /// Storage texel buffer
        const STORAGE_TEXEL_BUFFER = 0x0000_0008;
        /// Uniform buffer
        const UNIFORM_BUFFER = 0x0000_0010;
        /// Storage buffer
        const STORAGE_BUFFER = 0x0000_0020;
        /// Index buffer
        const INDEX_BUFFER = 0x0000_0040;
        /// Vertex buffer
        const VERTEX_BUFFER = 0x0000_0080;
        /// Indirect draw/dispatch arguments
        const INDIRECT_BUFFER = 0x0000_0100;
        /// Queried with `buffer_device_address`
        const SHADER_DEVICE_ADDRESS = 0x0002_0000;
        /// Acceleration structure build input
        const ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY = 0x0008_0000;
        /// Acceleration structure storage
        const ACCELERATION_STRUCTURE_STORAGE = 0x0010_0000;
        /// Sampler descriptor buffer
        const SAMPLER_DESCRIPTOR_BUFFER = 0x0020_0000;
        /// Resource descriptor buffer
        const RESOURCE_DESCRIPTOR_BUFFER = 0x0040_0000;
        /// Shader binding table
        const SHADER_BINDING_TABLE = 0x0000_0400;
    }
}

/// Descriptor-buffer usages that force the 32-bit address space
const DESCRIPTOR_BUFFER_USAGE: BufferUsageFlags = BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER
    .union(BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER);

/// Page size of sparse buffers
pub const SPARSE_PAGE_SIZE: u64 = 4096;

// =============================================================================
// TYPES
// =============================================================================

/// Parameters of [`Device::create_buffer`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BufferCreateInfo {
    /// Size in bytes
    pub size: u64,
    /// Creation flags
    pub flags: BufferCreateFlags,
    /// Usage
    pub usage: BufferUsageFlags,
    /// Address to reserve when replaying a capture, 0 for any
    pub opaque_capture_address: u64,
}

impl BufferCreateInfo {
    /// Non-sparse buffer of `size` bytes
    pub const fn new(size: u64, usage: BufferUsageFlags) -> Self {
        Self {
            size,
            flags: BufferCreateFlags::empty(),
            usage,
            opaque_capture_address: 0,
        }
    }

    /// Replace the creation flags
    pub const fn with_flags(mut self, flags: BufferCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Request a replayed address
    pub const fn with_capture_address(mut self, address: u64) -> Self {
        self.opaque_capture_address = address;
        self
    }
}

/// A `VkBuffer`
#[derive(Debug)]
pub struct Buffer {
    handle: BufferHandle,
    size: u64,
    flags: BufferCreateFlags,
    usage: BufferUsageFlags,
    /// Virtual BO owned by sparse buffers
    sparse_bo: Option<Bo>,
    /// Memory bound through `bind_buffer_memory`
    binding: Option<BoRef>,
    offset: u64,
    bo_va: u64,
    bo_size: u64,
}

impl Buffer {
    /// API handle
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Creation flags
    pub fn flags(&self) -> BufferCreateFlags {
        self.flags
    }

    /// Usage
    pub fn usage(&self) -> BufferUsageFlags {
        self.usage
    }

    /// Offset into the bound memory
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Base address of the bound BO, 0 when never bound
    pub fn bo_va(&self) -> u64 {
        self.bo_va
    }

    /// Size of the bound BO, 0 when never bound
    pub fn bo_size(&self) -> u64 {
        self.bo_size
    }

    /// Sparse buffer with its own virtual BO
    pub fn is_sparse(&self) -> bool {
        self.flags.contains(BufferCreateFlags::SPARSE_BINDING)
    }

    /// BO backing the buffer's addresses, if any
    fn backing(&self) -> Option<BoRef> {
        self.sparse_bo.as_ref().map(Bo::bo_ref).or(self.binding)
    }
}

/// Memory requirements of a buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Bytes to allocate
    pub size: u64,
    /// Required offset alignment
    pub alignment: u64,
    /// Acceptable memory type indices
    pub memory_type_bits: u32,
    /// Dedicated allocation required
    pub requires_dedicated_allocation: bool,
    /// Dedicated allocation preferred
    pub prefers_dedicated_allocation: bool,
}

/// One entry of [`Device::bind_buffer_memory`]
#[derive(Debug)]
pub struct BindBufferMemoryInfo<'a> {
    /// Buffer being bound
    pub buffer: &'a mut Buffer,
    /// Memory to bind
    pub memory: &'a DeviceMemory,
    /// Byte offset into `memory`
    pub memory_offset: u64,
    /// Per-entry status output
    pub status: Option<&'a mut VkResult>,
}

impl<'a> BindBufferMemoryInfo<'a> {
    /// Bind `buffer` at `memory_offset` without a status output
    pub fn new(buffer: &'a mut Buffer, memory: &'a DeviceMemory, memory_offset: u64) -> Self {
        Self {
            buffer,
            memory,
            memory_offset,
            status: None,
        }
    }

    /// Report this entry's result through `status`
    pub fn with_status(mut self, status: &'a mut VkResult) -> Self {
        self.status = Some(status);
        self
    }
}

/// One page range of a sparse bind
#[derive(Clone, Copy, Debug)]
pub struct SparseMemoryBind<'a> {
    /// Byte offset into the buffer
    pub resource_offset: u64,
    /// Byte size of the range
    pub size: u64,
    /// Backing memory, `None` to unbind
    pub memory: Option<&'a DeviceMemory>,
    /// Byte offset into `memory`
    pub memory_offset: u64,
}

impl SparseMemoryBind<'_> {
    fn memory_handle(&self) -> Option<u64> {
        self.memory.map(|m| m.handle().id())
    }

    /// `next` continues this range in both the buffer and the memory
    fn can_merge(&self, next: &Self) -> bool {
        self.memory_handle() == next.memory_handle()
            && self.resource_offset + self.size == next.resource_offset
            && (self.memory.is_none() || self.memory_offset + self.size == next.memory_offset)
    }
}

// =============================================================================
// DEVICE OPERATIONS
// =============================================================================

impl Device {
    /// Create a buffer
    ///
    /// Sparse buffers reserve their virtual address range immediately. Any
    /// failure there destroys the half-built buffer and reports device memory
    /// exhaustion.
    pub fn create_buffer(&self, info: &BufferCreateInfo) -> Result<Buffer> {
        self.create_buffer_internal(info, false)
    }

    pub(crate) fn create_buffer_internal(&self, info: &BufferCreateInfo, internal: bool) -> Result<Buffer> {
        let mut buffer = Buffer {
            handle: Handle::new(self.next_object_id()),
            size: info.size,
            flags: info.flags,
            usage: info.usage,
            sparse_bo: None,
            binding: None,
            offset: 0,
            bo_va: 0,
            bo_size: 0,
        };

        if info.flags.contains(BufferCreateFlags::SPARSE_BINDING) {
            let mut flags = BoFlags::VIRTUAL;
            if info.flags.contains(BufferCreateFlags::DEVICE_ADDRESS_CAPTURE_REPLAY) {
                flags |= BoFlags::REPLAYABLE;
            }
            if info.usage.contains(BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER) {
                flags |= BoFlags::ADDR_32BIT;
            }

            let bo_info = BoCreateInfo::new(
                align_up(info.size, SPARSE_PAGE_SIZE),
                SPARSE_PAGE_SIZE,
                BoDomain::empty(),
                flags,
            )
            .with_priority(BoPriority::VIRTUAL)
            .with_address(info.opaque_capture_address);

            match self.bo_create(&bo_info, BoundObject::Buffer(buffer.handle), internal) {
                Ok(bo) => buffer.sparse_bo = Some(bo),
                Err(err) => {
                    log::debug!("sparse reservation of {} bytes failed: {err:?}", info.size);
                    self.destroy_buffer(Some(buffer));
                    return Err(VkError::OutOfDeviceMemory);
                }
            }
        }

        self.log_memory_trace(MemoryTraceToken::BufferCreate {
            buffer: buffer.handle.id(),
            size: buffer.size,
            sparse: buffer.sparse_bo.is_some(),
        });
        if let Some(bo) = &buffer.sparse_bo {
            self.log_memory_trace(MemoryTraceToken::BufferBind {
                buffer: buffer.handle.id(),
                va: bo.va().raw(),
                size: buffer.size,
            });
        }

        Ok(buffer)
    }

    /// Destroy a buffer; `None` is a no-op
    pub fn destroy_buffer(&self, buffer: Option<Buffer>) {
        let Some(mut buffer) = buffer else {
            return;
        };

        if let Some(bo) = buffer.sparse_bo.take() {
            self.bo_destroy(BoundObject::Buffer(buffer.handle), bo);
        }

        if buffer.bo_va != 0 {
            self.report_address_binding(
                BoundObject::Buffer(buffer.handle),
                buffer.bo_va + buffer.offset,
                buffer.bo_size,
                AddressBindingKind::Unbind,
            );
        }

        self.log_memory_trace(MemoryTraceToken::ResourceDestroy {
            object: buffer.handle.id(),
        });
    }

    /// Bind a batch of buffers to memory
    ///
    /// Entries are processed in order and each one is independent: an entry
    /// whose memory is too small gets `ErrorUnknown` in its status output and
    /// is skipped, the entries around it are still bound, and the call
    /// returns `ErrorUnknown`. Nothing already bound is undone.
    pub fn bind_buffer_memory(&self, binds: &mut [BindBufferMemoryInfo<'_>]) -> Result<()> {
        let mut result = Ok(());

        for bind in binds.iter_mut() {
            if let Some(status) = bind.status.as_deref_mut() {
                *status = VkResult::Success;
            }

            let memory = bind.memory;
            if memory.alloc_size() != 0 {
                let reqs = self.buffer_memory_requirements(
                    bind.buffer.size,
                    bind.buffer.flags,
                    bind.buffer.usage,
                );
                if bind.memory_offset.saturating_add(reqs.size) > memory.alloc_size() {
                    if let Some(status) = bind.status.as_deref_mut() {
                        *status = VkResult::ErrorUnknown;
                    }
                    log::error!(
                        "device memory object too small for the buffer: {} + {} > {}",
                        bind.memory_offset,
                        reqs.size,
                        memory.alloc_size()
                    );
                    result = Err(VkError::Unknown);
                    continue;
                }
            }

            let bo = memory.bo();
            let buffer = &mut *bind.buffer;
            buffer.binding = Some(bo.bo_ref());
            buffer.offset = bind.memory_offset;
            buffer.bo_va = bo.va().raw();
            buffer.bo_size = bo.size();

            self.log_memory_trace(MemoryTraceToken::BufferBind {
                buffer: buffer.handle.id(),
                va: buffer.bo_va + buffer.offset,
                size: buffer.size,
            });
            self.report_address_binding(
                BoundObject::Buffer(buffer.handle),
                buffer.bo_va + buffer.offset,
                bo.size(),
                AddressBindingKind::Bind,
            );
        }

        result
    }

    /// Memory requirements of a buffer with the given parameters
    pub fn buffer_memory_requirements(
        &self,
        size: u64,
        flags: BufferCreateFlags,
        usage: BufferUsageFlags,
    ) -> MemoryRequirements {
        let types_32bit = self.physical.memory_types_32bit();
        let mut memory_type_bits = self.physical.memory_properties().all_types_mask() & !types_32bit;

        // Generated command buffers reach their upload space through 32-bit
        // pointers.
        if usage.contains(BufferUsageFlags::INDIRECT_BUFFER)
            && self.features.device_generated_commands
        {
            memory_type_bits |= types_32bit;
        }

        if usage.intersects(DESCRIPTOR_BUFFER_USAGE) {
            memory_type_bits = types_32bit;
        }

        let mut alignment = if flags.contains(BufferCreateFlags::SPARSE_BINDING) {
            SPARSE_PAGE_SIZE
        } else {
            16
        };

        // TLAS instances keep root ids in the low 6 bits.
        if usage.contains(BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE) {
            alignment = alignment.max(64);
        }

        MemoryRequirements {
            size: align_up(size, alignment),
            alignment,
            memory_type_bits,
            requires_dedicated_allocation: false,
            prefers_dedicated_allocation: false,
        }
    }

    /// Memory requirements of a laid-out image
    ///
    /// Images never go in 32-bit memory. Shareable tiled images need a
    /// dedicated allocation so the importer sees the layout metadata.
    pub fn image_memory_requirements(&self, image: &Image) -> MemoryRequirements {
        let memory_type_bits =
            self.physical.memory_properties().all_types_mask() & !self.physical.memory_types_32bit();
        let dedicated = image.shareable && !image.surface.is_linear;
        MemoryRequirements {
            size: image.surface.total_size,
            alignment: 1u64 << image.surface.alignment_log2.min(63),
            memory_type_bits,
            requires_dedicated_allocation: dedicated,
            prefers_dedicated_allocation: dedicated,
        }
    }

    /// GPU address of the buffer's first byte
    ///
    /// An unbound buffer reports just its offset.
    pub fn buffer_device_address(&self, buffer: &Buffer) -> u64 {
        buffer.backing().map_or(0, |bo| bo.va.raw()) + buffer.offset
    }

    /// Address to pass back through `opaque_capture_address` on replay
    pub fn buffer_opaque_capture_address(&self, buffer: &Buffer) -> u64 {
        buffer
            .backing()
            .map_or(0, |bo| bo.va.raw() + buffer.offset)
    }

    /// Map or unmap page ranges of a sparse buffer
    ///
    /// Adjacent ranges that continue each other in both the buffer and the
    /// memory are sent to the backend as one request.
    pub fn bind_sparse_buffer(&self, buffer: &Buffer, binds: &[SparseMemoryBind<'_>]) -> Result<()> {
        let Some(parent) = buffer.sparse_bo.as_ref() else {
            log::error!("sparse bind on non-sparse buffer {:?}", buffer.handle);
            return Err(VkError::Unknown);
        };

        let mut pending: Option<SparseMemoryBind<'_>> = None;
        for bind in binds {
            match pending.as_mut() {
                Some(range) if range.can_merge(bind) => range.size += bind.size,
                _ => {
                    if let Some(range) = pending.replace(*bind) {
                        self.sparse_virtual_bind(buffer, parent, &range)?;
                    }
                }
            }
        }
        if let Some(range) = pending {
            self.sparse_virtual_bind(buffer, parent, &range)?;
        }
        Ok(())
    }

    fn sparse_virtual_bind(&self, buffer: &Buffer, parent: &Bo, range: &SparseMemoryBind<'_>) -> Result<()> {
        let memory_bo = range.memory.map(DeviceMemory::bo);
        self.ws
            .buffer_virtual_bind(parent, range.resource_offset, range.size, memory_bo, range.memory_offset)
            .map_err(|err| {
                log::warn!("virtual bind of {:?} at {:#x} failed: {err}", buffer.handle, range.resource_offset);
                VkError::from(err)
            })?;

        let va = parent.va().raw();
        let (token, kind) = if memory_bo.is_some() {
            (
                MemoryTraceToken::SparseAddResidency {
                    va,
                    offset: range.resource_offset,
                },
                AddressBindingKind::Bind,
            )
        } else {
            (
                MemoryTraceToken::SparseRemoveResidency {
                    va,
                    offset: range.resource_offset,
                },
                AddressBindingKind::Unbind,
            )
        };
        self.log_memory_trace(token);
        self.report_address_binding(
            BoundObject::Buffer(buffer.handle),
            va + range.resource_offset,
            range.size,
            kind,
        );
        Ok(())
    }
}

static_assertions::assert_impl_all!(Buffer: Send, Sync);
