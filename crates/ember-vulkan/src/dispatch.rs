//! # Device Dispatch Tables
//!
//! Optional layers sit in front of the driver. Each layer owns a table
//! describing where its own calls go next, and the device table is where the
//! application's calls enter:
//!
//! ```text
//!   app call ──► device table ──► annotate ──► app ──► rgp ──► rra ──► rmv ──► ctx-roll ──► driver
//!                                 (only the layers that are enabled appear in the chain)
//! ```
//!
//! Tables are resolved once at device creation by a [`DispatchBuilder`]. A
//! provider added for table `T` fills every lower table that is in use, so a
//! layer's entry shadows the providers added after it and each layer table
//! points at the next layer down the chain.

use crate::config::AppLayer;

// =============================================================================
// TABLES
// =============================================================================

/// Dispatch table index; lower values sit closer to the application
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum DispatchTable {
    /// Entry point of application calls
    Device = 0,
    /// Command annotation for hang debugging and context roll tracking
    Annotate = 1,
    /// Per-application workarounds
    App = 2,
    /// Radeon GPU Profiler
    Rgp = 3,
    /// Radeon Raytracing Analyzer
    Rra = 4,
    /// Radeon Memory Visualizer
    Rmv = 5,
    /// Context roll logging
    CtxRoll = 6,
}

impl DispatchTable {
    /// Number of tables
    pub const COUNT: usize = 7;

    /// All tables in index order
    pub const ALL: [Self; Self::COUNT] = [
        Self::Device,
        Self::Annotate,
        Self::App,
        Self::Rgp,
        Self::Rra,
        Self::Rmv,
        Self::CtxRoll,
    ];

    /// Table index
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

// =============================================================================
// ENTRYPOINTS
// =============================================================================

macro_rules! entrypoints {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Device-level entrypoints routed through the dispatch tables
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(usize)]
        pub enum Entrypoint {
            $($(#[$doc])* $name,)*
        }

        impl Entrypoint {
            /// Every entrypoint, in table order
            pub const ALL: &'static [Entrypoint] = &[$(Entrypoint::$name,)*];
            /// Number of entrypoints
            pub const COUNT: usize = Self::ALL.len();

            /// Slot in a table
            #[inline]
            pub const fn index(self) -> usize {
                self as usize
            }
        }
    };
}

entrypoints! {
    /// `vkCreateBuffer`
    CreateBuffer,
    /// `vkDestroyBuffer`
    DestroyBuffer,
    /// `vkBindBufferMemory2`
    BindBufferMemory2,
    /// `vkGetBufferMemoryRequirements2`
    GetBufferMemoryRequirements2,
    /// `vkGetBufferDeviceAddress`
    GetBufferDeviceAddress,
    /// `vkAllocateMemory`
    AllocateMemory,
    /// `vkFreeMemory`
    FreeMemory,
    /// `vkFlushMappedMemoryRanges`
    FlushMappedMemoryRanges,
    /// `vkInvalidateMappedMemoryRanges`
    InvalidateMappedMemoryRanges,
    /// `vkGetDeviceQueue`
    GetDeviceQueue,
    /// `vkQueueSubmit2`
    QueueSubmit,
    /// `vkQueuePresentKHR`
    QueuePresent,
    /// `vkAcquireNextImageKHR`
    AcquireNextImage,
    /// `vkCreateSwapchainKHR`
    CreateSwapchain,
    /// `vkDestroySwapchainKHR`
    DestroySwapchain,
    /// `vkBeginCommandBuffer`
    BeginCommandBuffer,
    /// `vkCmdBeginRenderPass2`
    CmdBeginRenderPass,
    /// `vkCmdBeginRendering`
    CmdBeginRendering,
    /// `vkCmdDraw`
    CmdDraw,
    /// `vkCmdDrawIndexed`
    CmdDrawIndexed,
    /// `vkCmdDispatch`
    CmdDispatch,
    /// `vkCmdBindPipeline`
    CmdBindPipeline,
    /// `vkCmdPipelineBarrier2`
    CmdPipelineBarrier,
    /// `vkCreateGraphicsPipelines`
    CreateGraphicsPipelines,
    /// `vkCreateComputePipelines`
    CreateComputePipelines,
    /// `vkDestroyPipeline`
    DestroyPipeline,
    /// `vkCreateImageView`
    CreateImageView,
    /// `vkGetSemaphoreCounterValue`
    GetSemaphoreCounterValue,
    /// `vkCreateAccelerationStructureKHR`
    CreateAccelerationStructure,
    /// `vkDestroyAccelerationStructureKHR`
    DestroyAccelerationStructure,
    /// `vkCmdBuildAccelerationStructuresKHR`
    CmdBuildAccelerationStructures,
    /// `vkSetDebugUtilsObjectNameEXT`
    SetDebugUtilsObjectName,
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// A set of entrypoint implementations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Provider {
    /// The driver proper
    Driver,
    /// Window system integration
    Wsi,
    /// Shared runtime fallbacks
    Common,
    /// Command annotation
    Annotate,
    /// Application workaround layer
    App(AppLayer),
    /// RGP layer
    Rgp,
    /// RRA layer
    Rra,
    /// RMV layer
    Rmv,
    /// Context roll layer
    CtxRoll,
}

const WSI_ENTRYPOINTS: &[Entrypoint] = &[
    Entrypoint::QueuePresent,
    Entrypoint::AcquireNextImage,
    Entrypoint::CreateSwapchain,
    Entrypoint::DestroySwapchain,
];

const COMMON_ENTRYPOINTS: &[Entrypoint] = &[
    Entrypoint::GetDeviceQueue,
    Entrypoint::CmdBeginRenderPass,
    Entrypoint::SetDebugUtilsObjectName,
];

const ANNOTATE_ENTRYPOINTS: &[Entrypoint] = &[
    Entrypoint::CmdDraw,
    Entrypoint::CmdDrawIndexed,
    Entrypoint::CmdDispatch,
    Entrypoint::CmdBindPipeline,
    Entrypoint::CmdPipelineBarrier,
];

const RGP_ENTRYPOINTS: &[Entrypoint] = &[
    Entrypoint::QueueSubmit,
    Entrypoint::QueuePresent,
    Entrypoint::CmdDraw,
    Entrypoint::CmdDrawIndexed,
    Entrypoint::CmdDispatch,
    Entrypoint::CreateGraphicsPipelines,
    Entrypoint::CreateComputePipelines,
    Entrypoint::DestroyPipeline,
];

const RRA_ENTRYPOINTS: &[Entrypoint] = &[
    Entrypoint::CreateAccelerationStructure,
    Entrypoint::DestroyAccelerationStructure,
    Entrypoint::CmdBuildAccelerationStructures,
    Entrypoint::QueuePresent,
];

const RMV_ENTRYPOINTS: &[Entrypoint] = &[
    Entrypoint::QueuePresent,
    Entrypoint::FlushMappedMemoryRanges,
    Entrypoint::InvalidateMappedMemoryRanges,
    Entrypoint::SetDebugUtilsObjectName,
];

const CTX_ROLL_ENTRYPOINTS: &[Entrypoint] = &[Entrypoint::QueueSubmit, Entrypoint::BeginCommandBuffer];

impl Provider {
    /// Whether this provider implements `entrypoint`
    pub fn implements(self, entrypoint: Entrypoint) -> bool {
        match self {
            Self::Driver => {
                !WSI_ENTRYPOINTS.contains(&entrypoint) && !COMMON_ENTRYPOINTS.contains(&entrypoint)
            }
            Self::Wsi => WSI_ENTRYPOINTS.contains(&entrypoint),
            Self::Common => COMMON_ENTRYPOINTS.contains(&entrypoint),
            Self::Annotate => ANNOTATE_ENTRYPOINTS.contains(&entrypoint),
            Self::App(AppLayer::MetroExodus) => entrypoint == Entrypoint::GetSemaphoreCounterValue,
            Self::App(AppLayer::Rage2) => entrypoint == Entrypoint::CmdBeginRenderPass,
            Self::App(AppLayer::QuanticDream) => entrypoint == Entrypoint::CreateGraphicsPipelines,
            Self::Rgp => RGP_ENTRYPOINTS.contains(&entrypoint),
            Self::Rra => RRA_ENTRYPOINTS.contains(&entrypoint),
            Self::Rmv => RMV_ENTRYPOINTS.contains(&entrypoint),
            Self::CtxRoll => CTX_ROLL_ENTRYPOINTS.contains(&entrypoint),
        }
    }
}

// =============================================================================
// RESOLVED TABLES
// =============================================================================

/// One resolved table: the provider handling each entrypoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntrypointTable {
    entries: [Option<Provider>; Entrypoint::COUNT],
}

impl EntrypointTable {
    const EMPTY: Self = Self {
        entries: [None; Entrypoint::COUNT],
    };

    /// Provider for `entrypoint`, `None` when nothing implements it
    #[inline]
    pub fn get(&self, entrypoint: Entrypoint) -> Option<Provider> {
        self.entries[entrypoint.index()]
    }

    fn fill(&mut self, provider: Provider, overwrite: bool) {
        for &entrypoint in Entrypoint::ALL {
            let slot = &mut self.entries[entrypoint.index()];
            if provider.implements(entrypoint) && (overwrite || slot.is_none()) {
                *slot = Some(provider);
            }
        }
    }
}

/// Every table of a device, immutable after creation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDispatch {
    tables: [EntrypointTable; DispatchTable::COUNT],
    used: [bool; DispatchTable::COUNT],
}

impl DeviceDispatch {
    /// Resolved table
    pub fn table(&self, table: DispatchTable) -> &EntrypointTable {
        &self.tables[table.index()]
    }

    /// Provider an application call lands in
    pub fn entry(&self, entrypoint: Entrypoint) -> Option<Provider> {
        self.table(DispatchTable::Device).get(entrypoint)
    }

    /// Provider a layer forwards `entrypoint` to
    pub fn next(&self, layer: DispatchTable, entrypoint: Entrypoint) -> Option<Provider> {
        self.table(layer).get(entrypoint)
    }

    /// Whether a layer was added
    pub fn is_layer_enabled(&self, layer: DispatchTable) -> bool {
        self.used[layer.index()]
    }
}

/// Accumulates providers in priority order
#[derive(Debug)]
pub struct DispatchBuilder {
    tables: [EntrypointTable; DispatchTable::COUNT],
    used: [bool; DispatchTable::COUNT],
    initialized: [bool; DispatchTable::COUNT],
}

impl Default for DispatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchBuilder {
    /// No providers yet
    pub const fn new() -> Self {
        Self {
            tables: [EntrypointTable::EMPTY; DispatchTable::COUNT],
            used: [false; DispatchTable::COUNT],
            initialized: [false; DispatchTable::COUNT],
        }
    }

    /// Add a layer's entrypoints; the layer's own table becomes active
    pub fn add_layer(&mut self, provider: Provider, table: DispatchTable) -> &mut Self {
        self.add_entrypoints(provider, table.index());
        self.used[table.index()] = true;
        self
    }

    /// Add a terminal provider below every layer
    pub fn add_driver(&mut self, provider: Provider) -> &mut Self {
        self.add_entrypoints(provider, DispatchTable::COUNT);
        self
    }

    fn add_entrypoints(&mut self, provider: Provider, table: usize) {
        for i in (0..table).rev() {
            if i == DispatchTable::Device.index() || self.used[i] {
                self.tables[i].fill(provider, !self.initialized[i]);
                self.initialized[i] = true;
            }
        }
    }

    /// Freeze the tables
    pub fn build(&self) -> DeviceDispatch {
        DeviceDispatch {
            tables: self.tables,
            used: self.used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_drivers(builder: &mut DispatchBuilder) -> DeviceDispatch {
        builder
            .add_driver(Provider::Driver)
            .add_driver(Provider::Wsi)
            .add_driver(Provider::Common)
            .build()
    }

    #[test]
    fn test_no_layers_routes_to_drivers() {
        let dispatch = with_drivers(&mut DispatchBuilder::new());
        assert_eq!(dispatch.entry(Entrypoint::CreateBuffer), Some(Provider::Driver));
        assert_eq!(dispatch.entry(Entrypoint::QueuePresent), Some(Provider::Wsi));
        assert_eq!(dispatch.entry(Entrypoint::GetDeviceQueue), Some(Provider::Common));
        assert!(!dispatch.is_layer_enabled(DispatchTable::Rgp));
        // Unused layer tables stay empty.
        assert_eq!(dispatch.next(DispatchTable::Rgp, Entrypoint::QueueSubmit), None);
    }

    #[test]
    fn test_layers_chain_in_priority_order() {
        let mut builder = DispatchBuilder::new();
        builder
            .add_layer(Provider::Rgp, DispatchTable::Rgp)
            .add_layer(Provider::CtxRoll, DispatchTable::CtxRoll);
        let dispatch = with_drivers(&mut builder);

        assert_eq!(dispatch.entry(Entrypoint::QueueSubmit), Some(Provider::Rgp));
        assert_eq!(dispatch.next(DispatchTable::Rgp, Entrypoint::QueueSubmit), Some(Provider::CtxRoll));
        assert_eq!(dispatch.next(DispatchTable::CtxRoll, Entrypoint::QueueSubmit), Some(Provider::Driver));

        // Only ctx-roll hooks BeginCommandBuffer.
        assert_eq!(dispatch.entry(Entrypoint::BeginCommandBuffer), Some(Provider::CtxRoll));
        assert_eq!(
            dispatch.next(DispatchTable::Rgp, Entrypoint::BeginCommandBuffer),
            Some(Provider::CtxRoll)
        );
        assert_eq!(dispatch.entry(Entrypoint::QueuePresent), Some(Provider::Rgp));
        assert_eq!(dispatch.next(DispatchTable::Rgp, Entrypoint::QueuePresent), Some(Provider::Wsi));
    }

    #[test]
    fn test_app_layer_shadows_common() {
        let mut builder = DispatchBuilder::new();
        builder.add_layer(Provider::App(AppLayer::Rage2), DispatchTable::App);
        let dispatch = with_drivers(&mut builder);
        assert_eq!(
            dispatch.entry(Entrypoint::CmdBeginRenderPass),
            Some(Provider::App(AppLayer::Rage2))
        );
        assert_eq!(
            dispatch.next(DispatchTable::App, Entrypoint::CmdBeginRenderPass),
            Some(Provider::Common)
        );
    }

    #[test]
    fn test_annotate_sits_in_front_of_everything() {
        let mut builder = DispatchBuilder::new();
        builder
            .add_layer(Provider::Annotate, DispatchTable::Annotate)
            .add_layer(Provider::Rgp, DispatchTable::Rgp);
        let dispatch = with_drivers(&mut builder);
        assert_eq!(dispatch.entry(Entrypoint::CmdDraw), Some(Provider::Annotate));
        assert_eq!(dispatch.next(DispatchTable::Annotate, Entrypoint::CmdDraw), Some(Provider::Rgp));
        assert_eq!(dispatch.next(DispatchTable::Rgp, Entrypoint::CmdDraw), Some(Provider::Driver));
    }

    #[test]
    fn test_every_entrypoint_resolves() {
        let mut builder = DispatchBuilder::new();
        builder.add_layer(Provider::Rmv, DispatchTable::Rmv);
        let dispatch = with_drivers(&mut builder);
        for &entrypoint in Entrypoint::ALL {
            assert!(dispatch.entry(entrypoint).is_some(), "{entrypoint:?}");
            assert!(dispatch.next(DispatchTable::Rmv, entrypoint).is_some(), "{entrypoint:?}");
        }
    }
}
