//! # Buffer Objects
//!
//! Kernel-allocated GPU memory objects and their placement attributes.

use core::fmt;

use ember_core::{BoMarker, GpuAddr, Handle};

/// Backend-assigned BO identifier
pub type BoHandle = Handle<BoMarker>;

// =============================================================================
// DOMAINS & FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Memory pools a BO may be placed in
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BoDomain: u32 {
        /// System memory accessed through the GART
        const GTT = 1 << 1;
        /// Device-local memory
        const VRAM = 1 << 2;
        /// Global data share
        const GDS = 1 << 3;
        /// Ordered append
        const OA = 1 << 4;
    }
}

bitflags::bitflags! {
    /// BO creation flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BoFlags: u32 {
        /// CPU-visible placement required
        const CPU_ACCESS = 1 << 0;
        /// Never mapped by the CPU
        const NO_CPU_ACCESS = 1 << 1;
        /// Never exported to another process
        const NO_INTERPROCESS_SHARING = 1 << 2;
        /// Write-combined GTT mapping
        const GTT_WC = 1 << 3;
        /// Virtual address range only, pages bound later
        const VIRTUAL = 1 << 4;
        /// Address must fit in 32 bits
        const ADDR_32BIT = 1 << 5;
        /// GPU never writes the BO
        const READ_ONLY = 1 << 6;
        /// Address may be requested again on capture replay
        const REPLAYABLE = 1 << 7;
        /// Clear VRAM on allocation
        const ZERO_VRAM = 1 << 8;
        /// Prefer placement local to the allocating process
        const PREFER_LOCAL_BO = 1 << 9;
    }
}

/// Residency priority hint
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoPriority(pub u8);

impl BoPriority {
    /// Virtual BOs carry no pages, so priority is unused
    pub const VIRTUAL: Self = Self(0);
    /// Image metadata
    pub const METADATA: Self = Self(10);
    /// Default for application allocations
    pub const APPLICATION: Self = Self(14);
    /// Highest priority an application may request
    pub const APPLICATION_MAX: Self = Self(28);
    /// Query pools
    pub const QUERY_POOL: Self = Self(29);
    /// Descriptor memory
    pub const DESCRIPTOR: Self = Self(30);
    /// Upload and staging buffers
    pub const UPLOAD_BUFFER: Self = Self(30);
    /// Shader code
    pub const SHADER: Self = Self(31);
    /// Scratch memory
    pub const SCRATCH: Self = Self(31);
    /// Command streams
    pub const CS: Self = Self(31);
}

// =============================================================================
// CREATE INFO
// =============================================================================

/// Parameters for [`crate::Winsys::buffer_create`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoCreateInfo {
    /// Size in bytes
    pub size: u64,
    /// Required alignment of the virtual address
    pub alignment: u64,
    /// Placement
    pub domain: BoDomain,
    /// Creation flags
    pub flags: BoFlags,
    /// Residency priority
    pub priority: BoPriority,
    /// Requested virtual address, 0 for any
    pub address: u64,
}

impl BoCreateInfo {
    /// Allocation with no address request
    pub const fn new(size: u64, alignment: u64, domain: BoDomain, flags: BoFlags) -> Self {
        Self {
            size,
            alignment,
            domain,
            flags,
            priority: BoPriority::APPLICATION,
            address: 0,
        }
    }

    /// Set the residency priority
    pub const fn with_priority(mut self, priority: BoPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Request a specific virtual address
    pub const fn with_address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }
}

// =============================================================================
// BUFFER OBJECT
// =============================================================================

/// An owned buffer object
///
/// Not `Clone`: exactly one owner hands it back to the backend.
pub struct Bo {
    handle: BoHandle,
    va: GpuAddr,
    size: u64,
    domain: BoDomain,
    flags: BoFlags,
}

impl Bo {
    /// Construct a BO record; only backends call this
    pub const fn new(
        handle: BoHandle,
        va: GpuAddr,
        size: u64,
        domain: BoDomain,
        flags: BoFlags,
    ) -> Self {
        Self {
            handle,
            va,
            size,
            domain,
            flags,
        }
    }

    /// Backend handle
    pub const fn handle(&self) -> BoHandle {
        self.handle
    }

    /// Base virtual address
    pub const fn va(&self) -> GpuAddr {
        self.va
    }

    /// Size in bytes
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Placement
    pub const fn domain(&self) -> BoDomain {
        self.domain
    }

    /// Creation flags
    pub const fn flags(&self) -> BoFlags {
        self.flags
    }

    /// Non-owning view for objects that reference but do not own the BO
    pub const fn bo_ref(&self) -> BoRef {
        BoRef {
            handle: self.handle,
            va: self.va,
            size: self.size,
        }
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("handle", &self.handle.id())
            .field("va", &self.va)
            .field("size", &self.size)
            .field("domain", &self.domain)
            .finish()
    }
}

/// Non-owning reference to a BO
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoRef {
    /// Backend handle
    pub handle: BoHandle,
    /// Base virtual address
    pub va: GpuAddr,
    /// Size in bytes
    pub size: u64,
}

static_assertions::assert_impl_all!(Bo: Send, Sync);
static_assertions::assert_not_impl_any!(Bo: Clone, Copy);
