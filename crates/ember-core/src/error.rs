//! # EMBER Error Handling
//!
//! Error type returned by the memory backend and other hardware-facing code.
//!
//! These errors are deliberately coarse. The Vulkan layer maps them onto
//! API result codes; nothing below it needs more detail than "which resource
//! ran out" or "which handle was bad".

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// EMBER Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// EMBER backend error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation not supported on this hardware
    NotSupported,
    /// Subsystem failed to initialize
    NotInitialized,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of VRAM / GTT
    OutOfVram,
    /// Out of host memory
    OutOfMemory,
    /// Virtual address range exhausted or requested address unavailable
    OutOfAddressSpace,
    /// Address not aligned
    MisalignedAddress,
    /// CPU mapping of a buffer object failed
    MappingFailed,

    // =========================================================================
    // Handle Errors
    // =========================================================================
    /// Buffer object or context handle is not live
    InvalidHandle,
    /// File descriptor does not refer to an exportable/importable object
    InvalidFd,

    // =========================================================================
    // Context Errors
    // =========================================================================
    /// Hardware context creation rejected (e.g. priority not permitted)
    ContextCreationFailed,
    /// Kernel rejected the power state request
    PstateRejected,
}

impl Error {
    /// Whether the error means a memory pool ran dry
    pub const fn is_out_of_memory(self) -> bool {
        matches!(
            self,
            Self::OutOfVram | Self::OutOfMemory | Self::OutOfAddressSpace
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidParameter => "invalid parameter",
            Self::NotFound => "not found",
            Self::NotSupported => "not supported",
            Self::NotInitialized => "not initialized",
            Self::OutOfVram => "out of device memory",
            Self::OutOfMemory => "out of host memory",
            Self::OutOfAddressSpace => "out of GPU virtual address space",
            Self::MisalignedAddress => "misaligned address",
            Self::MappingFailed => "buffer mapping failed",
            Self::InvalidHandle => "invalid handle",
            Self::InvalidFd => "invalid file descriptor",
            Self::ContextCreationFailed => "hardware context creation failed",
            Self::PstateRejected => "power state request rejected",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_classification() {
        assert!(Error::OutOfVram.is_out_of_memory());
        assert!(Error::OutOfAddressSpace.is_out_of_memory());
        assert!(!Error::InvalidHandle.is_out_of_memory());
    }
}
