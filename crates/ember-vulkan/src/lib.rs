//! # EMBER Vulkan
//!
//! Device lifecycle and buffer resource management for the EMBER Vulkan
//! driver.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         ember-vulkan                              │
//! │                                                                   │
//! │  ┌──────────────┐   ┌──────────────────────────────────────────┐  │
//! │  │ PhysicalDev  │──►│ Device                                   │  │
//! │  │ (chip, heaps,│   │  plan ─► stages ─► rollback / teardown   │  │
//! │  │  queues)     │   │  dispatch · traces · shader parts · VRS  │  │
//! │  └──────────────┘   └───────────────┬──────────────────────────┘  │
//! │                                     │                             │
//! │  ┌──────────────┐   ┌───────────────┴──┐   ┌──────────────────┐   │
//! │  │ Buffer       │──►│ DeviceMemory     │   │ Preamble / PM4   │   │
//! │  │ (sparse VA,  │   │ (BOs, fd import, │   │ (CmdStream)      │   │
//! │  │  binding)    │   │  heap budget)    │   │                  │   │
//! │  └──────────────┘   └────────┬─────────┘   └──────────────────┘   │
//! └──────────────────────────────┼────────────────────────────────────┘
//!                                │ dyn Winsys
//!                    ember-winsys · ember-surface · ember-core
//! ```
//!
//! Every fallible entry point returns [`Result`] with a [`VkError`]; the
//! matching [`VkResult`] code is one `From` away.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod buffer;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod memory;
pub mod physical;
pub mod preamble;
pub mod pstate;
pub mod report;
pub mod result;
pub mod shader_part;
pub mod timestamp;
pub mod trace;
pub mod vrs;

pub use buffer::{
    BindBufferMemoryInfo, Buffer, BufferCreateFlags, BufferCreateInfo, BufferUsageFlags,
    MemoryRequirements, SPARSE_PAGE_SIZE, SparseMemoryBind,
};
pub use config::{
    AppInfo, AppLayer, DebugFlags, DriverConfig, DriverOptions, PerftestFlags, TraceMode,
    make_api_version,
};
pub use device::{
    BufferRobustness, Device, DeviceCacheKey, DeviceCreateInfo, DeviceCreatePlan,
    DeviceFeatures, DeviceQueueCreateInfo, DeviceState, InitStage, OverallocationBehavior,
    PipelineCache, Queue, create_device, destroy_device,
};
pub use dispatch::{DeviceDispatch, DispatchBuilder, DispatchTable, Entrypoint, Provider};
pub use memory::{DeviceMemory, ExternalMemoryHandleType, MemoryAllocateInfo};
pub use physical::{
    PhysicalDevice, QueueFamily, VkMemoryHeap, VkMemoryHeapFlags, VkMemoryPropertyFlags,
    VkMemoryType, VkPhysicalDeviceMemoryProperties, VkQueueFamilyProperties, VkQueueFlags,
};
pub use report::{
    AddressBindingCallback, AddressBindingKind, AddressBindingReport, BoundObject, BufferHandle,
    MemoryHandle,
};
pub use result::{Result, VkError, VkResult};
pub use shader_part::{
    PassthroughCompiler, PsEpilogKey, ShaderBinary, ShaderCompiler, ShaderPart, ShaderPartCache,
    VsPrologKey,
};
pub use timestamp::{CalibratedTimestamps, TimeDomain};
pub use trace::{MemoryTrace, MemoryTraceToken};
pub use vrs::{VrsRate, VrsState};
