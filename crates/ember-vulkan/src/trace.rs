//! # Debugging and Capture Subsystems
//!
//! Device-owned state for the optional tools enabled at device creation:
//!
//! ```text
//! ┌────────────────┬─────────────────────────────────────────────────────┐
//! │ FaultTrace     │ hang debugging: trace BO written by every IB        │
//! │ ThreadTrace    │ RGP: per-SE thread trace buffer                     │
//! │ Spm            │ RGP: streaming performance monitor samples          │
//! │ MemoryTrace    │ RMV: token log of every allocation and binding      │
//! │ RraTrace       │ RRA: acceleration structures and ray history        │
//! │ TrapHandler    │ shader exceptions: TMA buffer + trap handler code   │
//! │ PrintfBuffer   │ shader printf ring                                  │
//! └────────────────┴─────────────────────────────────────────────────────┘
//! ```
//!
//! Writing captures to disk happens elsewhere; this module only owns the GPU
//! resources and the trigger flags.

use core::sync::atomic::{AtomicBool, Ordering};

use ember_core::{ChipInfo, align_up};
use ember_winsys::{Bo, BoCreateInfo, BoDomain, BoFlags, BoPriority, Winsys};
use hashbrown::HashMap;
use spin::Mutex;

use crate::device::Device;
use crate::memory::MappedBo;
use crate::result::{Result, VkError};
use crate::shader_part::ShaderCompiler;

// =============================================================================
// MEMORY TRACE (RMV)
// =============================================================================

/// One memory trace event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryTraceToken {
    /// API buffer created
    BufferCreate {
        /// Buffer handle
        buffer: u64,
        /// Size in bytes
        size: u64,
        /// Sparse binding buffer
        sparse: bool,
    },
    /// API buffer bound to memory
    BufferBind {
        /// Buffer handle
        buffer: u64,
        /// Bound address
        va: u64,
        /// Buffer size
        size: u64,
    },
    /// API object destroyed
    ResourceDestroy {
        /// Object handle
        object: u64,
    },
    /// API memory allocated
    HeapCreate {
        /// Memory handle
        memory: u64,
        /// Base address
        va: u64,
        /// Size in bytes
        size: u64,
    },
    /// BO allocated
    BoAllocate {
        /// Base address
        va: u64,
        /// Size in bytes
        size: u64,
        /// Allocated by the driver for itself
        internal: bool,
    },
    /// BO freed
    BoDestroy {
        /// Base address
        va: u64,
    },
    /// Page range of a sparse BO made resident
    SparseAddResidency {
        /// Base address of the virtual BO
        va: u64,
        /// Offset of the range
        offset: u64,
    },
    /// Page range of a sparse BO evicted
    SparseRemoveResidency {
        /// Base address of the virtual BO
        va: u64,
        /// Offset of the range
        offset: u64,
    },
    /// Border color palette allocated
    BorderColorPaletteCreate {
        /// Palette address
        va: u64,
    },
    /// Border color palette freed
    BorderColorPaletteDestroy {
        /// Palette address
        va: u64,
    },
}

/// RMV token log
#[derive(Debug, Default)]
pub struct MemoryTrace {
    tokens: Mutex<Vec<MemoryTraceToken>>,
}

impl MemoryTrace {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token
    pub fn log(&self, token: MemoryTraceToken) {
        self.tokens.lock().push(token);
    }

    /// Tokens logged since the last dump
    pub fn snapshot(&self) -> Vec<MemoryTraceToken> {
        self.tokens.lock().clone()
    }

    /// Hand off every pending token, returning how many there were
    pub fn dump(&self) -> Vec<MemoryTraceToken> {
        core::mem::take(&mut *self.tokens.lock())
    }
}

impl Device {
    pub(crate) fn log_memory_trace(&self, token: MemoryTraceToken) {
        if let Some(trace) = &self.memory_trace {
            trace.log(token);
        }
    }

    /// Pending memory trace tokens; empty unless RMV tracing is enabled
    pub fn memory_trace_tokens(&self) -> Vec<MemoryTraceToken> {
        self.memory_trace
            .as_ref()
            .map(MemoryTrace::snapshot)
            .unwrap_or_default()
    }
}

// =============================================================================
// FAULT DETECTION
// =============================================================================

/// Size of the hang debugging trace BO
pub const TRACE_BO_SIZE: u64 = 4096;

/// Hang debugging state
#[derive(Debug)]
pub(crate) struct FaultTrace {
    bo: MappedBo,
}

impl FaultTrace {
    pub(crate) fn init(ws: &dyn Winsys) -> Result<Self> {
        let info = BoCreateInfo::new(
            TRACE_BO_SIZE,
            8,
            BoDomain::VRAM,
            BoFlags::CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING | BoFlags::ZERO_VRAM,
        )
        .with_priority(BoPriority::UPLOAD_BUFFER);
        let bo = MappedBo::create(ws, &info, true).map_err(|_| VkError::InitializationFailed)?;
        Ok(Self { bo })
    }

    /// Address of the trace ring
    pub(crate) fn va(&self) -> u64 {
        self.bo.va()
    }

    pub(crate) fn finish(self, ws: &dyn Winsys) {
        self.bo.destroy(ws);
    }
}

// =============================================================================
// THREAD TRACE (RGP)
// =============================================================================

/// Per-SE header preceding the thread trace data
const THREAD_TRACE_INFO_SIZE: u64 = 32;

/// SPM sample buffer size
pub const SPM_BUFFER_SIZE: u64 = 32 * 1024 * 1024;

/// RGP thread trace state
#[derive(Debug)]
pub(crate) struct ThreadTrace {
    bo: MappedBo,
    buffer_size: u64,
    triggered: AtomicBool,
}

impl ThreadTrace {
    pub(crate) fn init(ws: &dyn Winsys, chip: &ChipInfo, buffer_size: u64) -> Result<Self> {
        let max_se = u64::from(chip.max_se.max(1));
        let buffer_size = align_up(buffer_size.max(4096), 4096);
        let size = align_up(THREAD_TRACE_INFO_SIZE * max_se, 4096) + buffer_size * max_se;

        let info = BoCreateInfo::new(
            size,
            4096,
            BoDomain::GTT,
            BoFlags::CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING | BoFlags::ZERO_VRAM,
        )
        .with_priority(BoPriority::SCRATCH);
        let bo = MappedBo::create(ws, &info, true).map_err(|_| VkError::InitializationFailed)?;

        Ok(Self {
            bo,
            buffer_size,
            triggered: AtomicBool::new(false),
        })
    }

    /// Bytes of trace data per shader engine
    pub(crate) fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub(crate) fn trigger(&self) {
        self.triggered.store(true, Ordering::Release);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    pub(crate) fn finish(self, ws: &dyn Winsys) {
        self.bo.destroy(ws);
    }
}

/// RGP streaming performance monitor state
#[derive(Debug)]
pub(crate) struct Spm {
    bo: MappedBo,
}

impl Spm {
    pub(crate) fn init(ws: &dyn Winsys) -> Result<Self> {
        let info = BoCreateInfo::new(
            SPM_BUFFER_SIZE,
            4096,
            BoDomain::GTT,
            BoFlags::CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING | BoFlags::ZERO_VRAM,
        )
        .with_priority(BoPriority::SCRATCH);
        let bo = MappedBo::create(ws, &info, true).map_err(|_| VkError::InitializationFailed)?;
        Ok(Self { bo })
    }

    pub(crate) fn finish(self, ws: &dyn Winsys) {
        self.bo.destroy(ws);
    }
}

// =============================================================================
// RAY TRACING ANALYZER
// =============================================================================

/// RRA capture state
#[derive(Debug)]
pub(crate) struct RraTrace {
    ray_history: Option<MappedBo>,
    accel_structs: Mutex<HashMap<u64, u64>>,
    triggered: AtomicBool,
}

impl RraTrace {
    pub(crate) fn init(ws: &dyn Winsys, ray_history_size: u64) -> Result<Self> {
        let ray_history = if ray_history_size == 0 {
            None
        } else {
            let info = BoCreateInfo::new(
                align_up(ray_history_size, 4096),
                4096,
                BoDomain::GTT,
                BoFlags::CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING,
            )
            .with_priority(BoPriority::UPLOAD_BUFFER);
            Some(MappedBo::create(ws, &info, false)?)
        };

        Ok(Self {
            ray_history,
            accel_structs: Mutex::new(HashMap::new()),
            triggered: AtomicBool::new(false),
        })
    }

    /// Remember an acceleration structure for the next capture
    pub(crate) fn register_accel_struct(&self, handle: u64, va: u64) {
        self.accel_structs.lock().insert(handle, va);
    }

    pub(crate) fn trigger(&self) {
        self.triggered.store(true, Ordering::Release);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    pub(crate) fn finish(self, ws: &dyn Winsys) {
        self.accel_structs.lock().clear();
        if let Some(bo) = self.ray_history {
            bo.destroy(ws);
        }
    }
}

// =============================================================================
// TRAP HANDLER
// =============================================================================

/// Trap memory area size
const TMA_BO_SIZE: u64 = 4096;

/// Shader trap handler state
#[derive(Debug)]
pub(crate) struct TrapHandler {
    shader: Bo,
    tma: MappedBo,
}

impl TrapHandler {
    pub(crate) fn init(ws: &dyn Winsys, compiler: &dyn ShaderCompiler) -> Result<Self> {
        let Some(binary) = compiler.compile_trap_handler() else {
            log::error!("failed to create the trap handler shader");
            return Err(VkError::InitializationFailed);
        };

        let code: &[u8] = bytemuck::cast_slice(&binary.code);
        let shader_info = BoCreateInfo::new(
            align_up(code.len() as u64, 256).max(256),
            256,
            BoDomain::VRAM,
            BoFlags::CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING | BoFlags::READ_ONLY | BoFlags::ADDR_32BIT,
        )
        .with_priority(BoPriority::SHADER);
        let shader = MappedBo::create(ws, &shader_info, true)
            .map_err(|_| VkError::InitializationFailed)?;
        shader.mapping.write(0, code);

        let tma_info = BoCreateInfo::new(
            TMA_BO_SIZE,
            256,
            BoDomain::VRAM,
            BoFlags::CPU_ACCESS
                | BoFlags::NO_INTERPROCESS_SHARING
                | BoFlags::ZERO_VRAM
                | BoFlags::ADDR_32BIT,
        )
        .with_priority(BoPriority::SCRATCH);
        let tma = match MappedBo::create(ws, &tma_info, true) {
            Ok(tma) => tma,
            Err(_) => {
                shader.destroy(ws);
                return Err(VkError::InitializationFailed);
            }
        };

        // The handler saves its state right after the pointer to the area.
        let save_area = tma.va() + 16;
        tma.mapping.write(0, &save_area.to_le_bytes());

        // Shader code stays resident but is never written again.
        let MappedBo { bo, .. } = shader;
        ws.buffer_unmap(&bo);

        Ok(Self { shader: bo, tma })
    }

    pub(crate) fn finish(self, ws: &dyn Winsys) {
        self.tma.destroy(ws);
        if ws.buffer_make_resident(&self.shader, false).is_err() {
            log::warn!("failed to evict the trap handler shader");
        }
        ws.buffer_destroy(self.shader);
    }
}

// =============================================================================
// SHADER PRINTF
// =============================================================================

/// Header at the start of the printf buffer: write offset and total size
pub const PRINTF_HEADER_SIZE: u32 = 8;

/// Shader printf ring
#[derive(Debug)]
pub(crate) struct PrintfBuffer {
    bo: MappedBo,
}

impl PrintfBuffer {
    pub(crate) fn init(ws: &dyn Winsys, size: u32) -> Result<Self> {
        let info = BoCreateInfo::new(
            u64::from(size),
            4096,
            BoDomain::GTT,
            BoFlags::CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING,
        )
        .with_priority(BoPriority::UPLOAD_BUFFER);
        let bo = MappedBo::create(ws, &info, true)?;

        let header = [PRINTF_HEADER_SIZE, size];
        bo.mapping.write(0, bytemuck::cast_slice(&header));
        Ok(Self { bo })
    }

    /// Address shaders write to
    pub(crate) fn va(&self) -> u64 {
        self.bo.va()
    }

    pub(crate) fn finish(self, ws: &dyn Winsys) {
        self.bo.destroy(ws);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ChipFamily;
    use ember_winsys::{NullWinsys, WinsysCall};

    #[test]
    fn test_memory_trace_dump_drains() {
        let trace = MemoryTrace::new();
        trace.log(MemoryTraceToken::BoDestroy { va: 0x1000 });
        trace.log(MemoryTraceToken::ResourceDestroy { object: 7 });
        assert_eq!(trace.snapshot().len(), 2);
        assert_eq!(trace.dump().len(), 2);
        assert!(trace.snapshot().is_empty());
    }

    #[test]
    fn test_fault_trace_is_resident_and_freed() {
        let ws = NullWinsys::new();
        let trace = FaultTrace::init(&ws).unwrap();
        assert_ne!(trace.va(), 0);
        assert_eq!(ws.resident_bo_count(), 1);
        trace.finish(&ws);
        assert_eq!(ws.live_bo_count(), 0);
        assert_eq!(ws.resident_bo_count(), 0);
    }

    #[test]
    fn test_fault_trace_map_failure_is_initialization_failure() {
        let ws = NullWinsys::new();
        ws.fail_nth(WinsysCall::BufferMap, 1);
        assert_eq!(FaultTrace::init(&ws).unwrap_err(), VkError::InitializationFailed);
        assert_eq!(ws.live_bo_count(), 0);
    }

    #[test]
    fn test_thread_trace_sized_per_shader_engine() {
        let ws = NullWinsys::new();
        let chip = ChipInfo::for_family(ChipFamily::Navi21);
        let trace = ThreadTrace::init(&ws, &chip, 64 * 1024).unwrap();
        let (size, domain, _) = ws.bo_placement(trace.bo.bo.handle()).unwrap();
        assert_eq!(size, 4096 + 64 * 1024 * u64::from(chip.max_se));
        assert_eq!(domain, BoDomain::GTT);
        assert!(!trace.is_triggered());
        trace.trigger();
        assert!(trace.is_triggered());
        trace.finish(&ws);
        assert_eq!(ws.live_bo_count(), 0);
    }

    #[test]
    fn test_trap_handler_writes_save_area_pointer() {
        let ws = NullWinsys::new();
        let trap = TrapHandler::init(&ws, &crate::shader_part::PassthroughCompiler).unwrap();
        let tma = ws.bo_contents(trap.tma.bo.handle()).unwrap();
        let mut pointer = [0u8; 8];
        pointer.copy_from_slice(&tma[..8]);
        assert_eq!(u64::from_le_bytes(pointer), trap.tma.va() + 16);
        trap.finish(&ws);
        assert_eq!(ws.live_bo_count(), 0);
    }

    #[test]
    fn test_trap_handler_rolls_back_shader_on_tma_failure() {
        let ws = NullWinsys::new();
        ws.fail_nth(WinsysCall::BufferCreate, 2);
        let err = TrapHandler::init(&ws, &crate::shader_part::PassthroughCompiler).unwrap_err();
        assert_eq!(err, VkError::InitializationFailed);
        assert_eq!(ws.live_bo_count(), 0);
    }

    #[test]
    fn test_printf_header() {
        let ws = NullWinsys::new();
        let printf = PrintfBuffer::init(&ws, 4096).unwrap();
        let contents = ws.bo_contents(printf.bo.bo.handle()).unwrap();
        assert_eq!(&contents[..8], &[8, 0, 0, 0, 0, 0x10, 0, 0]);
        printf.finish(&ws);
    }

    #[test]
    fn test_rra_without_history_buffer() {
        let ws = NullWinsys::new();
        let rra = RraTrace::init(&ws, 0).unwrap();
        rra.register_accel_struct(1, 0x1000);
        assert_eq!(ws.live_bo_count(), 0);
        rra.trigger();
        assert!(rra.is_triggered());
        rra.finish(&ws);
    }
}
