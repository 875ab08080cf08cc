//! # Vulkan Result Codes
//!
//! VkResult definition and the error half used as `Err` by every fallible
//! entry point.

use core::fmt;

// =============================================================================
// VK RESULT
// =============================================================================

macro_rules! vk_results {
    ($($(#[$doc:meta])* $name:ident = $raw:literal => $text:literal,)*) => {
        /// Vulkan result code, as returned across the API
        #[repr(i32)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum VkResult {
            $($(#[$doc])* $name = $raw,)*
        }

        impl VkResult {
            /// Code for a raw value; unknown values collapse to `ErrorUnknown`
            pub fn from_raw(value: i32) -> Self {
                match value {
                    $($raw => Self::$name,)*
                    _ => Self::ErrorUnknown,
                }
            }

            /// `VK_*` name
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => $text,)*
                }
            }
        }
    };
}

vk_results! {
    /// No error
    Success = 0 => "VK_SUCCESS",
    /// Host allocation failed
    ErrorOutOfHostMemory = -1 => "VK_ERROR_OUT_OF_HOST_MEMORY",
    /// BO allocation or VA reservation failed
    ErrorOutOfDeviceMemory = -2 => "VK_ERROR_OUT_OF_DEVICE_MEMORY",
    /// A device subsystem could not start
    ErrorInitializationFailed = -3 => "VK_ERROR_INITIALIZATION_FAILED",
    /// The GPU stopped responding
    ErrorDeviceLost = -4 => "VK_ERROR_DEVICE_LOST",
    /// CPU mapping refused
    ErrorMemoryMapFailed = -5 => "VK_ERROR_MEMORY_MAP_FAILED",
    /// Requested feature unavailable on this chip
    ErrorFeatureNotPresent = -8 => "VK_ERROR_FEATURE_NOT_PRESENT",
    /// Object limit reached
    ErrorTooManyObjects = -10 => "VK_ERROR_TOO_MANY_OBJECTS",
    /// Anything without a dedicated code
    ErrorUnknown = -13 => "VK_ERROR_UNKNOWN",
    /// fd or host pointer that cannot be imported
    ErrorInvalidExternalHandle = -1000072003 => "VK_ERROR_INVALID_EXTERNAL_HANDLE",
    /// Replayed address already in use
    ErrorInvalidOpaqueCaptureAddress = -1000257000 => "VK_ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS",
}

impl VkResult {
    /// Negative codes are errors
    pub const fn is_error(self) -> bool {
        (self as i32) < 0
    }

    /// Raw value
    pub const fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for VkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// RESULT HELPERS
// =============================================================================

/// Result of a fallible driver entry point
pub type Result<T> = core::result::Result<T, VkError>;

/// Vulkan error variant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VkError {
    /// Out of host memory
    OutOfHostMemory,
    /// Out of device memory
    OutOfDeviceMemory,
    /// Initialization failed
    InitializationFailed,
    /// Device lost
    DeviceLost,
    /// Memory map failed
    MemoryMapFailed,
    /// Feature not present
    FeatureNotPresent,
    /// Too many objects
    TooManyObjects,
    /// External handle is not of an importable type
    InvalidExternalHandle,
    /// Requested capture address is taken
    InvalidOpaqueCaptureAddress,
    /// Unknown error
    Unknown,
}

impl From<VkError> for VkResult {
    fn from(e: VkError) -> Self {
        match e {
            VkError::OutOfHostMemory => VkResult::ErrorOutOfHostMemory,
            VkError::OutOfDeviceMemory => VkResult::ErrorOutOfDeviceMemory,
            VkError::InitializationFailed => VkResult::ErrorInitializationFailed,
            VkError::DeviceLost => VkResult::ErrorDeviceLost,
            VkError::MemoryMapFailed => VkResult::ErrorMemoryMapFailed,
            VkError::FeatureNotPresent => VkResult::ErrorFeatureNotPresent,
            VkError::TooManyObjects => VkResult::ErrorTooManyObjects,
            VkError::InvalidExternalHandle => VkResult::ErrorInvalidExternalHandle,
            VkError::InvalidOpaqueCaptureAddress => VkResult::ErrorInvalidOpaqueCaptureAddress,
            VkError::Unknown => VkResult::ErrorUnknown,
        }
    }
}

impl<T> From<Result<T>> for VkResult {
    fn from(r: Result<T>) -> Self {
        match r {
            Ok(_) => VkResult::Success,
            Err(e) => e.into(),
        }
    }
}

impl From<ember_core::Error> for VkError {
    fn from(e: ember_core::Error) -> Self {
        use ember_core::Error;
        match e {
            Error::OutOfVram | Error::OutOfAddressSpace => VkError::OutOfDeviceMemory,
            Error::OutOfMemory => VkError::OutOfHostMemory,
            Error::MappingFailed => VkError::MemoryMapFailed,
            Error::InvalidFd => VkError::InvalidExternalHandle,
            Error::NotSupported => VkError::FeatureNotPresent,
            Error::NotInitialized | Error::ContextCreationFailed => {
                VkError::InitializationFailed
            }
            _ => VkError::Unknown,
        }
    }
}

impl fmt::Display for VkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&VkResult::from(*self), f)
    }
}

impl std::error::Error for VkError {}
