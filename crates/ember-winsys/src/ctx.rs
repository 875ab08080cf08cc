//! Hardware submission contexts and power states.

use ember_core::{CtxMarker, Handle};

/// Backend-assigned context identifier
pub type CtxHandle = Handle<CtxMarker>;

/// Scheduling priority of a hardware context
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CtxPriority {
    /// Background work
    Low = 0,
    /// Default
    Medium = 1,
    /// Latency sensitive
    High = 2,
    /// Compositors and VR; needs privileges
    Realtime = 3,
}

impl CtxPriority {
    /// Number of priorities
    pub const COUNT: usize = 4;

    /// All priorities, lowest first
    pub const ALL: [Self; Self::COUNT] = [Self::Low, Self::Medium, Self::High, Self::Realtime];

    /// Table index
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Stable power state requested for profiling
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pstate {
    /// Return to dynamic clocks
    None,
    /// Stable standard clocks
    Standard,
    /// Minimum shader clock
    MinSclk,
    /// Minimum memory clock
    MinMclk,
    /// Maximum clocks
    Peak,
}

/// An owned hardware context
#[derive(Debug)]
pub struct HwCtx {
    handle: CtxHandle,
    priority: CtxPriority,
}

impl HwCtx {
    /// Construct a context record; only backends call this
    pub const fn new(handle: CtxHandle, priority: CtxPriority) -> Self {
        Self { handle, priority }
    }

    /// Backend handle
    pub const fn handle(&self) -> CtxHandle {
        self.handle
    }

    /// Priority the context was created with
    pub const fn priority(&self) -> CtxPriority {
        self.priority
    }
}
