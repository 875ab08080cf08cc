//! # Logical Device
//!
//! Device creation runs a fixed sequence of stages. Every stage that leaves
//! something behind is recorded as an [`InitStage`]; a failure drops the
//! half-built device, which unwinds the recorded stages newest first.
//! Destruction unwinds the same list.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ plan + derived state + dispatch tables        (no resources)         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ HwCtx(prio)…  Queues  ShaderUploadQueue                              │
//! │ [FaultTrace] [ThreadTrace [Spm]] [MemoryTrace] [TrapHandler]         │
//! │ [ForceVrs]   cache key   Meta   MSAA tables                          │
//! │ [BorderColor] [VsPrologs] [PsEpilogs] [GfxPreamble]                  │
//! │ PipelineCache [PerfCounters] [RraTrace] [CaptureReplay] [Printf]     │
//! │ [PstatePeak]                                                         │
//! └──────────────────────────────────────────────────────────────────────┘
//!          teardown: lazy VRS state, compute scratch, then stages ▲
//! ```
//!
//! Every enablement decision is taken once, up front, in a
//! [`DeviceCreatePlan`]; the stages never consult the configuration again.

use core::sync::atomic::AtomicU64;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use ember_core::GfxLevel;
use ember_surface::msaa::SamplePositions;
use ember_winsys::{
    Bo, BoCreateInfo, BoDomain, BoFlags, BoPriority, CtxHandle, CtxPriority, HwCtx, Winsys,
};
use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::config::{DebugFlags, DriverConfig, PerftestFlags, TraceMode, make_api_version};
use crate::dispatch::{DeviceDispatch, DispatchBuilder, DispatchTable, Provider};
use crate::memory::CpuMapping;
use crate::physical::{MAX_QUEUE_FAMILIES, PhysicalDevice, QueueFamily, VK_MAX_MEMORY_HEAPS};
use crate::preamble::{CmdStream, GfxPreamble, opcode, pkt3};
use crate::report::{AddressBindingCallback, BoundObject};
use crate::result::{Result, VkError};
use crate::shader_part::{
    MAX_PRECOMPILED_INSTANCE_RATE_ATTRIBS, MAX_VERTEX_ATTRIBS, NUM_INSTANCE_RATE_PROLOGS,
    PrologNextStage, PsEpilogKey, ShaderCompiler, ShaderPart, ShaderPartCache, VsPrologKey,
    bit_consecutive, instance_rate_prolog_index, is_consecutive_mask,
};
use crate::trace::{
    FaultTrace, MemoryTrace, MemoryTraceToken, PRINTF_HEADER_SIZE, PrintfBuffer, RraTrace, Spm,
    ThreadTrace, TrapHandler,
};
use crate::vrs::{ForceVrs, VrsState};

// =============================================================================
// CREATE INFO
// =============================================================================

/// Features the application enabled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    /// `bufferDeviceAddress`
    pub buffer_device_address: bool,
    /// `descriptorIndexing`
    pub descriptor_indexing: bool,
    /// `rayTracingPipeline`
    pub ray_tracing_pipeline: bool,
    /// `accelerationStructure`
    pub acceleration_structure: bool,
    /// `rayTracingPipelineShaderGroupHandleCaptureReplay`
    pub ray_tracing_capture_replay: bool,
    /// `robustBufferAccess`
    pub robust_buffer_access: bool,
    /// `robustBufferAccess2`
    pub robust_buffer_access2: bool,
    /// `dualSrcBlend`
    pub dual_src_blend: bool,
    /// `image2DViewOf3D`
    pub image_2d_view_of_3d: bool,
    /// `meshShaderQueries`
    pub mesh_shader_queries: bool,
    /// `primitivesGeneratedQuery`
    pub primitives_generated_query: bool,
    /// `shaderObject`
    pub shader_object: bool,
    /// `customBorderColors`
    pub custom_border_colors: bool,
    /// `vertexInputDynamicState`
    pub vertex_input_dynamic_state: bool,
    /// `graphicsPipelineLibrary`
    pub graphics_pipeline_library: bool,
    /// `extendedDynamicState3ColorBlendEnable`
    pub eds3_color_blend_enable: bool,
    /// `extendedDynamicState3ColorWriteMask`
    pub eds3_color_write_mask: bool,
    /// `extendedDynamicState3AlphaToCoverageEnable`
    pub eds3_alpha_to_coverage_enable: bool,
    /// `extendedDynamicState3ColorBlendEquation`
    pub eds3_color_blend_equation: bool,
    /// `performanceCounterQueryPools`
    pub performance_counter_query_pools: bool,
    /// `deviceGeneratedCommands`
    pub device_generated_commands: bool,
}

/// Queues requested from one family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceQueueCreateInfo {
    /// Index into the physical device's queue families
    pub family_index: u32,
    /// Number of queues
    pub queue_count: u32,
    /// Global priority of the family's queues
    pub priority: CtxPriority,
}

impl DeviceQueueCreateInfo {
    /// `queue_count` queues of `family_index` at medium priority
    pub const fn new(family_index: u32, queue_count: u32) -> Self {
        Self {
            family_index,
            queue_count,
            priority: CtxPriority::Medium,
        }
    }

    /// Override the global priority
    pub const fn with_priority(mut self, priority: CtxPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// `VkMemoryOverallocationBehaviorAMD`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OverallocationBehavior {
    /// Driver default (allowed)
    #[default]
    Default,
    /// Allocations may exceed heap sizes
    Allowed,
    /// Allocations past a heap's size fail
    Disallowed,
}

/// Device creation parameters
#[derive(Clone, Default)]
pub struct DeviceCreateInfo {
    /// Requested queues
    pub queue_create_infos: Vec<DeviceQueueCreateInfo>,
    /// Enabled features
    pub features: DeviceFeatures,
    /// Heap overallocation policy
    pub overallocation: OverallocationBehavior,
    /// Receives address binding reports
    pub address_binding_callback: Option<AddressBindingCallback>,
}

impl DeviceCreateInfo {
    /// One general queue, no optional features
    pub fn new() -> Self {
        Self {
            queue_create_infos: vec![DeviceQueueCreateInfo::new(0, 1)],
            ..Self::default()
        }
    }

    /// Replace the queue requests
    pub fn with_queues(mut self, queues: &[DeviceQueueCreateInfo]) -> Self {
        self.queue_create_infos = queues.to_vec();
        self
    }

    /// Replace the enabled features
    pub fn with_features(mut self, features: DeviceFeatures) -> Self {
        self.features = features;
        self
    }

    /// Set the overallocation policy
    pub fn with_overallocation(mut self, behavior: OverallocationBehavior) -> Self {
        self.overallocation = behavior;
        self
    }

    /// Install an address binding callback
    pub fn with_address_binding_callback(mut self, callback: AddressBindingCallback) -> Self {
        self.address_binding_callback = Some(callback);
        self
    }
}

impl core::fmt::Debug for DeviceCreateInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceCreateInfo")
            .field("queue_create_infos", &self.queue_create_infos)
            .field("features", &self.features)
            .field("overallocation", &self.overallocation)
            .field("address_binding_callback", &self.address_binding_callback.is_some())
            .finish()
    }
}

// =============================================================================
// PLAN AND DERIVED STATE
// =============================================================================

/// Which optional subsystems device creation brings up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCreatePlan {
    /// Command annotation layer
    pub annotate: bool,
    /// Hang debugging trace BO
    pub fault_detection: bool,
    /// RGP thread trace
    pub thread_trace: bool,
    /// RGP streaming performance monitor
    pub spm: bool,
    /// RMV memory trace
    pub memory_trace: bool,
    /// Shader trap handler
    pub trap_handler: bool,
    /// Forced VRS rate
    pub force_vrs: bool,
    /// Custom border color palette
    pub border_color: bool,
    /// VS prolog cache
    pub vs_prologs: bool,
    /// Fill the VS prolog cache at creation time
    pub precompile_vs_prologs: bool,
    /// PS epilog cache
    pub ps_epilogs: bool,
    /// Graphics preamble IB
    pub gfx_preamble: bool,
    /// Performance counter resources
    pub perf_counters: bool,
    /// RRA capture state
    pub rra_trace: bool,
    /// Ray tracing capture-replay table
    pub capture_replay: bool,
    /// Shader printf buffer
    pub printf: bool,
    /// Hold peak clocks for the device's lifetime
    pub pstate_peak: bool,
    /// Context roll logging layer
    pub ctx_roll: bool,
}

impl DeviceCreatePlan {
    /// Evaluate every enablement condition
    pub fn new(physical: &PhysicalDevice, config: &DriverConfig, info: &DeviceCreateInfo) -> Self {
        let chip = physical.info();
        let f = &info.features;
        let hang = config.debug.contains(DebugFlags::HANG);
        let rgp = config.trace.contains(TraceMode::RGP);
        let vs_prologs =
            f.vertex_input_dynamic_state || f.graphics_pipeline_library || f.shader_object;

        Self {
            annotate: hang || rgp,
            fault_detection: hang,
            thread_trace: rgp,
            spm: rgp && config.thread_trace_cache_counters,
            memory_trace: config.trace.contains(TraceMode::RMV),
            trap_handler: config.trap_handler,
            force_vrs: chip.gfx_level == GfxLevel::Gfx10_3
                && (config.force_vrs_config_file.is_some() || config.force_vrs.is_some()),
            border_color: f.custom_border_colors,
            vs_prologs,
            precompile_vs_prologs: vs_prologs && !config.debug.contains(DebugFlags::DUMP_PROLOGS),
            ps_epilogs: f.graphics_pipeline_library
                || f.shader_object
                || f.eds3_color_blend_enable
                || f.eds3_color_write_mask
                || f.eds3_alpha_to_coverage_enable
                || f.eds3_color_blend_equation,
            gfx_preamble: !config.debug.contains(DebugFlags::NO_IBS),
            perf_counters: f.performance_counter_query_pools,
            rra_trace: config.trace.contains(TraceMode::RRA) && physical.rt_enabled(config),
            capture_replay: f.ray_tracing_capture_replay,
            printf: config.printf_buffer_size >= PRINTF_HEADER_SIZE,
            pstate_peak: chip.gfx_level == GfxLevel::Gfx11
                && chip.has_dedicated_vram
                && config.options.force_pstate_peak_gfx11_dgpu,
            ctx_roll: config.trace.contains(TraceMode::CTX_ROLL),
        }
    }
}

/// Robust buffer access level
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BufferRobustness {
    /// No bounds checking
    #[default]
    Disabled,
    /// `robustBufferAccess`
    Robust,
    /// `robustBufferAccess2`
    Robust2,
}

/// `COMPUTE_DISPATCH_INITIATOR` bits
pub mod dispatch_initiator {
    /// Start the compute shader
    pub const COMPUTE_SHADER_EN: u32 = 1 << 0;
    /// In-order wave launch (GFX7+)
    pub const ORDER_MODE: u32 = 1 << 3;
    /// Task shaders must not be preempted mid-dispatch
    pub const DISABLE_DISP_PREMPT_EN: u32 = 1 << 10;
    /// Tunnel dispatches past draws (GFX10+)
    pub const TUNNEL_ENABLE: u32 = 1 << 13;
}

/// Values computed once at creation from the chip, configuration and features
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// Submit every BO with every submission
    pub use_global_bo_list: bool,
    /// Robust buffer access level
    pub buffer_robustness: BufferRobustness,
    /// Heap usage is tracked and capped
    pub overallocation_disallowed: bool,
    /// Context registers are shadowed in memory
    pub uses_shadow_regs: bool,
    /// Shaders live in invisible VRAM and are uploaded by DMA
    pub shader_use_invisible_vram: bool,
    /// Primitive binning allowed
    pub pbb_allowed: bool,
    /// Texture coordinate truncation disabled
    pub disable_trunc_coord: bool,
    /// Waves a compute scratch allocation must cover
    pub scratch_waves: u32,
    /// Dispatch initiator for compute
    pub dispatch_initiator: u32,
    /// Dispatch initiator for task shaders
    pub dispatch_initiator_task: u32,
    /// Compute grid size comes from user SGPRs
    pub load_grid_size_from_user_sgpr: bool,
    /// Keep shader metadata around for tools
    pub keep_shader_info: bool,
    /// Wait for idle after every shader
    pub sync_shaders: bool,
    /// Pipeline cache disabled
    pub cache_disabled: bool,
    /// Forced anisotropy, negative when not forcing
    pub force_aniso: i32,
}

impl DeviceState {
    /// Derive the device's fixed state
    pub fn new(
        physical: &PhysicalDevice,
        config: &DriverConfig,
        info: &DeviceCreateInfo,
        plan: &DeviceCreatePlan,
    ) -> Self {
        let chip = physical.info();
        let f = &info.features;
        let gfx = chip.gfx_level;

        let buffer_robustness = if f.robust_buffer_access2 {
            BufferRobustness::Robust2
        } else if f.robust_buffer_access {
            BufferRobustness::Robust
        } else {
            BufferRobustness::Disabled
        };

        let mut disable_trunc_coord = config.options.disable_trunc_coord;
        if config.app.engine_name == "DXVK" {
            // D3D9 needs truncation. Older DXVK only tells D3D9 apart by the
            // missing dual source blending; newer versions flag it in the
            // application version.
            let mut is_d3d9 = !f.dual_src_blend;
            if config.app.engine_version > make_api_version(2, 3, 0) {
                is_d3d9 = config.app.app_version & 1 != 0;
            }
            disable_trunc_coord &= !is_d3d9;
        }

        let mut initiator = dispatch_initiator::COMPUTE_SHADER_EN;
        if gfx >= GfxLevel::Gfx7 {
            initiator |= dispatch_initiator::ORDER_MODE;
        }
        if gfx >= GfxLevel::Gfx10 {
            initiator |= dispatch_initiator::TUNNEL_ENABLE;
        }

        let hang = config.debug.contains(DebugFlags::HANG);

        Self {
            use_global_bo_list: config.perftest.contains(PerftestFlags::BO_LIST)
                || f.buffer_device_address
                || f.descriptor_indexing
                || f.ray_tracing_pipeline
                || f.acceleration_structure,
            buffer_robustness,
            overallocation_disallowed: info.overallocation == OverallocationBehavior::Disallowed,
            uses_shadow_regs: chip.register_shadowing_required
                || config.debug.contains(DebugFlags::SHADOW_REGS),
            shader_use_invisible_vram: config.perftest.contains(PerftestFlags::DMA_SHADERS)
                && gfx >= GfxLevel::Gfx7,
            pbb_allowed: gfx >= GfxLevel::Gfx9 && !config.debug.contains(DebugFlags::NO_BINNING),
            disable_trunc_coord,
            scratch_waves: (32 * chip.num_cu).max(2048 / 64),
            dispatch_initiator: initiator,
            dispatch_initiator_task: initiator | dispatch_initiator::DISABLE_DISP_PREMPT_EN,
            load_grid_size_from_user_sgpr: gfx >= GfxLevel::Gfx10_3,
            keep_shader_info: hang
                || config.trap_handler
                || config.debug.contains(DebugFlags::SHADER_INFO),
            sync_shaders: hang || config.debug.contains(DebugFlags::SYNC_SHADERS),
            cache_disabled: plan.printf || config.debug.contains(DebugFlags::NO_CACHE),
            force_aniso: config.tex_aniso.min(16),
        }
    }
}

/// State that changes compiled shaders and so feeds the cache UUID
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DeviceCacheKey {
    /// Texture coordinate truncation disabled
    pub disable_trunc_coord: u8,
    /// 2D views of 3D images need the GFX9 workaround
    pub image_2d_view_of_3d: u8,
    /// Mesh shader pipeline statistics queries
    pub mesh_shader_queries: u8,
    /// Primitives generated queries
    pub primitives_generated_query: u8,
}

static_assertions::assert_eq_size!(DeviceCacheKey, u32);

impl DeviceCacheKey {
    fn new(physical: &PhysicalDevice, features: &DeviceFeatures, state: &DeviceState) -> Self {
        let gfx9 = physical.gfx_level() == GfxLevel::Gfx9;
        let mut key = Self {
            disable_trunc_coord: state.disable_trunc_coord as u8,
            image_2d_view_of_3d: (features.image_2d_view_of_3d && gfx9) as u8,
            mesh_shader_queries: features.mesh_shader_queries as u8,
            primitives_generated_query: features.primitives_generated_query as u8,
        };
        // Shader objects can be used with any of these at any time.
        if features.shader_object {
            key.image_2d_view_of_3d = gfx9 as u8;
            key.primitives_generated_query = 1;
        }
        key
    }
}

// =============================================================================
// INIT STAGES
// =============================================================================

/// A completed creation stage that owns something to undo
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InitStage {
    /// Hardware context of one priority
    HwCtx(CtxPriority),
    /// Queue objects
    Queues,
    /// Dedicated context for DMA shader uploads
    ShaderUploadQueue,
    /// Hang debugging trace BO
    FaultTrace,
    /// RGP thread trace
    ThreadTrace,
    /// RGP SPM
    Spm,
    /// RMV token log
    MemoryTrace,
    /// Trap handler shader and TMA
    TrapHandler,
    /// Forced VRS rate and notifier thread
    ForceVrs,
    /// Meta shader arena
    Meta,
    /// Border color palette
    BorderColor,
    /// VS prolog cache
    VsPrologs,
    /// PS epilog cache
    PsEpilogs,
    /// Graphics preamble BO
    GfxPreamble,
    /// Pipeline cache
    PipelineCache,
    /// Performance counter BO and lock streams
    PerfCounters,
    /// RRA capture state
    RraTrace,
    /// Capture-replay address table
    CaptureReplay,
    /// Shader printf buffer
    Printf,
    /// Profiling lock held for peak clocks
    PstatePeak,
}

// =============================================================================
// SUBSYSTEMS
// =============================================================================

/// A device queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Queue {
    family: QueueFamily,
    family_index: u32,
    index: u32,
    priority: CtxPriority,
    ctx: CtxHandle,
}

impl Queue {
    /// Queue family type
    pub fn family(&self) -> QueueFamily {
        self.family
    }

    /// Family index
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Index within the family
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Global priority
    pub fn priority(&self) -> CtxPriority {
        self.priority
    }

    /// Hardware context shared by every queue of this priority
    pub fn ctx(&self) -> CtxHandle {
        self.ctx
    }
}

/// Meta shader arena size
const META_ARENA_SIZE: u64 = 256 * 1024;

#[derive(Debug)]
pub(crate) struct MetaState {
    bo: Bo,
}

/// Border color palette slots
pub const BORDER_COLOR_COUNT: usize = 4096;
/// Bytes per border color
const BORDER_COLOR_SIZE: usize = 16;
/// Border color palette bytes
pub const BORDER_COLOR_BUFFER_SIZE: u64 = (BORDER_COLOR_COUNT * BORDER_COLOR_SIZE) as u64;

#[derive(Debug)]
pub(crate) struct BorderColor {
    bo: Bo,
    mapping: CpuMapping,
    used: Mutex<[u64; BORDER_COLOR_COUNT / 64]>,
}

#[derive(Debug)]
pub(crate) struct VsPrologs {
    base: VsPrologKey,
    simple: Vec<Arc<ShaderPart>>,
    instance_rate: Vec<Arc<ShaderPart>>,
    cache: ShaderPartCache<VsPrologKey, ShaderPart>,
}

impl VsPrologs {
    fn lookup(&self, key: &VsPrologKey) -> Option<Arc<ShaderPart>> {
        let precompiled = !self.simple.is_empty()
            && key.next_stage == self.base.next_stage
            && key.as_ls == self.base.as_ls
            && key.is_ngg == self.base.is_ngg
            && key.wave32 == self.base.wave32;

        if precompiled {
            let num = key.num_attributes;
            let inputs = key.instance_rate_inputs;
            if inputs == 0 && (1..=MAX_VERTEX_ATTRIBS).contains(&num) {
                return self.simple.get(num as usize - 1).cloned();
            }
            if (1..=MAX_PRECOMPILED_INSTANCE_RATE_ATTRIBS).contains(&num)
                && is_consecutive_mask(inputs)
                && inputs >> num == 0
            {
                return self
                    .instance_rate
                    .get(instance_rate_prolog_index(num, inputs))
                    .cloned();
            }
        }

        self.cache.get_or_create(key)
    }
}

fn compile_vs_prolog(compiler: &dyn ShaderCompiler, key: &VsPrologKey) -> Option<ShaderPart> {
    compiler
        .compile_vs_prolog(key)
        .map(|binary| ShaderPart::new(key, binary))
}

fn compile_ps_epilog(compiler: &dyn ShaderCompiler, key: &PsEpilogKey) -> Option<ShaderPart> {
    compiler
        .compile_ps_epilog(key)
        .map(|binary| ShaderPart::new(key, binary))
}

/// Compiled pipeline blobs keyed by pipeline hash
#[derive(Debug)]
pub struct PipelineCache {
    uuid: [u8; 32],
    disabled: bool,
    entries: RwLock<HashMap<[u8; 32], Arc<[u8]>>>,
}

impl PipelineCache {
    fn new(uuid: [u8; 32], disabled: bool) -> Self {
        Self {
            uuid,
            disabled,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry_key(&self, key: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.uuid);
        hasher.update(key);
        *hasher.finalize().as_bytes()
    }

    /// Cached blob, never found while the cache is disabled
    pub fn lookup(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        if self.disabled {
            return None;
        }
        self.entries.read().get(&self.entry_key(key)).cloned()
    }

    /// Store a blob; returns false when caching is disabled
    pub fn insert(&self, key: &[u8], blob: &[u8]) -> bool {
        if self.disabled {
            return false;
        }
        let entry = self.entry_key(key);
        self.entries.write().insert(entry, Arc::from(blob));
        true
    }

    /// Cached blobs
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Nothing cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookups always miss
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

/// Passes a performance query can take
pub const PERF_CTR_MAX_PASSES: u32 = 512;
const PERF_CTR_BO_FENCE_OFFSET: u64 = 0;
const PERF_CTR_BO_PASS_OFFSET: u64 = 16;
/// Performance counter BO bytes: fence, then one qword per pass
pub const PERF_CTR_BO_SIZE: u64 = PERF_CTR_BO_PASS_OFFSET + 8 * PERF_CTR_MAX_PASSES as u64;

#[derive(Debug)]
pub(crate) struct PerfCounters {
    bo: Bo,
    lock_cs: Mutex<Vec<Option<CmdStream>>>,
}

/// Stream marking a counter pass as taken (`1`) or released (`0`)
fn build_perf_counter_lock_cs(bo_va: u64, pass: u32, unlock: bool) -> CmdStream {
    const DST_SEL_MEM: u32 = 5 << 8;
    const WR_CONFIRM: u32 = 1 << 20;

    let va = bo_va + PERF_CTR_BO_PASS_OFFSET + 8 * u64::from(pass);
    let mut cs = CmdStream::new();
    cs.emit(pkt3(opcode::WRITE_DATA, 3, false));
    cs.emit(DST_SEL_MEM | WR_CONFIRM);
    cs.emit(va as u32);
    cs.emit((va >> 32) as u32);
    cs.emit(u32::from(!unlock));
    cs
}

/// Open context roll log
#[derive(Debug)]
pub(crate) struct CtxRollLog {
    path: PathBuf,
    file: File,
}

// =============================================================================
// DEVICE
// =============================================================================

/// A logical device
pub struct Device {
    pub(crate) physical: Arc<PhysicalDevice>,
    pub(crate) ws: Arc<dyn Winsys>,
    pub(crate) config: DriverConfig,
    pub(crate) features: DeviceFeatures,
    pub(crate) plan: DeviceCreatePlan,
    pub(crate) state: DeviceState,
    pub(crate) dispatch: DeviceDispatch,
    pub(crate) address_binding_callback: Option<AddressBindingCallback>,
    pub(crate) object_ids: AtomicU64,
    pub(crate) heap_usage: Mutex<[u64; VK_MAX_MEMORY_HEAPS]>,

    // Independent locks, one per subsystem.
    pub(crate) trace_lock: Mutex<()>,
    pub(crate) pstate_cnt: Mutex<u32>,
    pub(crate) rt_handles: Mutex<HashMap<u32, [u8; 32]>>,
    pub(crate) compute_scratch: Mutex<Option<Bo>>,
    pub(crate) ctx_roll: Mutex<Option<CtxRollLog>>,

    pub(crate) hw_ctx: [Option<HwCtx>; CtxPriority::COUNT],
    pub(crate) queues: [Vec<Queue>; MAX_QUEUE_FAMILIES],
    pub(crate) shader_upload_ctx: Option<HwCtx>,
    pub(crate) fault_trace: Option<FaultTrace>,
    pub(crate) thread_trace: Option<ThreadTrace>,
    pub(crate) spm: Option<Spm>,
    pub(crate) memory_trace: Option<MemoryTrace>,
    pub(crate) trap_handler: Option<TrapHandler>,
    pub(crate) force_vrs: Option<ForceVrs>,
    pub(crate) vrs_state: Mutex<Option<VrsState>>,
    pub(crate) cache_key: DeviceCacheKey,
    pub(crate) cache_hash: [u8; 32],
    pub(crate) meta: Option<MetaState>,
    pub(crate) sample_positions: SamplePositions,
    pub(crate) border_color: Option<BorderColor>,
    pub(crate) vs_prologs: Option<VsPrologs>,
    pub(crate) ps_epilogs: Option<ShaderPartCache<PsEpilogKey, ShaderPart>>,
    pub(crate) gfx_preamble: Option<GfxPreamble>,
    pub(crate) pipeline_cache: Option<PipelineCache>,
    pub(crate) perf_counters: Option<PerfCounters>,
    pub(crate) rra_trace: Option<RraTrace>,
    pub(crate) capture_replay: Option<Mutex<HashMap<u64, u64>>>,
    pub(crate) printf: Option<PrintfBuffer>,

    stages: Vec<InitStage>,
}

static_assertions::assert_impl_all!(Device: Send, Sync);

impl Device {
    /// Create a device
    ///
    /// On failure every stage that completed is undone, newest first, and
    /// the first error is returned.
    ///
    /// # Panics
    ///
    /// Never; requesting RGP on a chip older than GFX8 or newer than GFX11
    /// aborts the process instead.
    pub fn create(
        physical: Arc<PhysicalDevice>,
        config: &DriverConfig,
        info: &DeviceCreateInfo,
    ) -> Result<Self> {
        let plan = DeviceCreatePlan::new(&physical, config, info);
        let state = DeviceState::new(&physical, config, info, &plan);
        let dispatch = build_dispatch(config, &plan);
        let cache_key = DeviceCacheKey::new(&physical, &info.features, &state);
        let cache_hash = *blake3::hash(bytemuck::bytes_of(&cache_key)).as_bytes();

        let mut device = Self {
            ws: Arc::clone(physical.winsys()),
            physical,
            config: config.clone(),
            features: info.features,
            plan,
            state,
            dispatch,
            address_binding_callback: info.address_binding_callback.clone(),
            object_ids: AtomicU64::new(1),
            heap_usage: Mutex::new([0; VK_MAX_MEMORY_HEAPS]),
            trace_lock: Mutex::new(()),
            pstate_cnt: Mutex::new(0),
            rt_handles: Mutex::new(HashMap::new()),
            compute_scratch: Mutex::new(None),
            ctx_roll: Mutex::new(None),
            hw_ctx: [None, None, None, None],
            queues: Default::default(),
            shader_upload_ctx: None,
            fault_trace: None,
            thread_trace: None,
            spm: None,
            memory_trace: None,
            trap_handler: None,
            force_vrs: None,
            vrs_state: Mutex::new(None),
            cache_key,
            cache_hash,
            meta: None,
            sample_positions: SamplePositions::default(),
            border_color: None,
            vs_prologs: None,
            ps_epilogs: None,
            gfx_preamble: None,
            pipeline_cache: None,
            perf_counters: None,
            rra_trace: None,
            capture_replay: None,
            printf: None,
            stages: Vec::new(),
        };

        device.init_hw_contexts(info)?;
        device.init_queues(info)?;
        device.init_shader_upload_queue()?;

        if device.plan.fault_detection {
            device.init_fault_detection()?;
        }
        if device.plan.thread_trace {
            device.init_thread_trace()?;
        }
        if device.plan.memory_trace {
            device.memory_trace = Some(MemoryTrace::new());
            device.stages.push(InitStage::MemoryTrace);
        }
        if device.plan.trap_handler {
            device.init_trap_handler()?;
        }
        if device.plan.force_vrs {
            device.init_force_vrs();
        }

        device.init_meta()?;
        device.sample_positions = SamplePositions::new();

        if device.plan.border_color {
            device.init_border_color()?;
        }
        if device.plan.vs_prologs {
            device.init_vs_prologs()?;
        }
        if device.plan.ps_epilogs {
            let compiler = Arc::clone(device.physical.compiler());
            device.ps_epilogs = Some(ShaderPartCache::new(move |key: &PsEpilogKey| {
                compile_ps_epilog(compiler.as_ref(), key)
            }));
            device.stages.push(InitStage::PsEpilogs);
        }
        if device.plan.gfx_preamble {
            if let Some(preamble) = device.create_gfx_preamble() {
                device.gfx_preamble = Some(preamble);
                device.stages.push(InitStage::GfxPreamble);
            }
        }

        device.pipeline_cache = Some(PipelineCache::new(
            device.cache_hash,
            device.state.cache_disabled,
        ));
        device.stages.push(InitStage::PipelineCache);

        if device.state.force_aniso >= 0 {
            let aniso = u32::try_from(device.state.force_aniso).unwrap_or(0);
            let shown = if aniso > 0 { 1u32 << aniso.ilog2() } else { 1 };
            log::info!("Forcing anisotropy filter to {shown}x");
        }

        if device.plan.perf_counters {
            device.init_perf_counters()?;
        }
        if device.plan.rra_trace {
            let history = device.config.rra_history_size;
            device.rra_trace = Some(RraTrace::init(device.ws.as_ref(), history)?);
            device.stages.push(InitStage::RraTrace);
        }
        if device.plan.capture_replay {
            device.capture_replay = Some(Mutex::new(HashMap::new()));
            device.stages.push(InitStage::CaptureReplay);
        }
        if device.plan.printf {
            let size = device.config.printf_buffer_size;
            device.printf = Some(PrintfBuffer::init(device.ws.as_ref(), size)?);
            device.stages.push(InitStage::Printf);
        }
        if device.plan.pstate_peak {
            match device.acquire_profiling_lock() {
                Ok(()) => device.stages.push(InitStage::PstatePeak),
                Err(_) => log::warn!("failed to set pstate to profile_peak"),
            }
        }

        log::debug!(
            "created device on {:?}: {} init stages",
            device.physical.info().family,
            device.stages.len()
        );
        Ok(device)
    }

    // =========================================================================
    // Stages
    // =========================================================================

    fn init_hw_contexts(&mut self, info: &DeviceCreateInfo) -> Result<()> {
        for queue_info in &info.queue_create_infos {
            let priority = queue_info.priority;
            if self.hw_ctx[priority.index()].is_some() {
                continue;
            }
            let ctx = self.ws.ctx_create(priority)?;
            self.hw_ctx[priority.index()] = Some(ctx);
            self.stages.push(InitStage::HwCtx(priority));
        }
        Ok(())
    }

    fn init_queues(&mut self, info: &DeviceCreateInfo) -> Result<()> {
        for queue_info in &info.queue_create_infos {
            let Some(props) = self
                .physical
                .queue_families()
                .get(queue_info.family_index as usize)
                .copied()
            else {
                log::error!("queue family {} does not exist", queue_info.family_index);
                return Err(VkError::InitializationFailed);
            };
            let Some(ctx) = self.hw_ctx[queue_info.priority.index()].as_ref() else {
                return Err(VkError::InitializationFailed);
            };
            let ctx = ctx.handle();

            let queues = &mut self.queues[queue_info.family_index as usize];
            if queues.len() as u32 + queue_info.queue_count > props.queue_count {
                log::error!(
                    "{} queues requested from family {}, which has {}",
                    queue_info.queue_count,
                    queue_info.family_index,
                    props.queue_count
                );
                return Err(VkError::InitializationFailed);
            }
            let first = queues.len() as u32;
            queues.extend((0..queue_info.queue_count).map(|i| Queue {
                family: props.family,
                family_index: queue_info.family_index,
                index: first + i,
                priority: queue_info.priority,
                ctx,
            }));
        }
        self.stages.push(InitStage::Queues);
        Ok(())
    }

    fn init_shader_upload_queue(&mut self) -> Result<()> {
        if !self.state.shader_use_invisible_vram {
            return Ok(());
        }
        self.shader_upload_ctx = Some(self.ws.ctx_create(CtxPriority::Medium)?);
        self.stages.push(InitStage::ShaderUploadQueue);
        Ok(())
    }

    fn init_fault_detection(&mut self) -> Result<()> {
        self.fault_trace = Some(FaultTrace::init(self.ws.as_ref())?);
        self.stages.push(InitStage::FaultTrace);

        log::warn!("*****************************************************************************");
        log::warn!("* WARNING: Hang debugging is enabled; this will reduce performance!         *");
        log::warn!("*****************************************************************************");
        Ok(())
    }

    fn init_thread_trace(&mut self) -> Result<()> {
        let gfx = self.physical.gfx_level();
        if gfx < GfxLevel::Gfx8 || gfx > GfxLevel::Gfx11 {
            log::error!("RGP traces are not supported on {gfx:?}; only GFX8 to GFX11 are");
            std::process::abort();
        }

        let buffer_size = self.config.thread_trace_buffer_size;
        self.thread_trace = Some(ThreadTrace::init(self.ws.as_ref(), self.physical.info(), buffer_size)?);
        self.stages.push(InitStage::ThreadTrace);
        log::info!("Thread trace support is enabled (initial buffer size: {} MiB).", buffer_size >> 20);

        if self.plan.spm {
            if gfx >= GfxLevel::Gfx10 {
                self.spm = Some(Spm::init(self.ws.as_ref())?);
                self.stages.push(InitStage::Spm);
            } else {
                log::warn!("SPM isn't supported on {gfx:?}, performance counters won't be collected");
            }
        }
        Ok(())
    }

    fn init_trap_handler(&mut self) -> Result<()> {
        log::warn!("*****************************************************************************");
        log::warn!("* WARNING: The shader trap handler is experimental and only for debugging! *");
        log::warn!("*****************************************************************************");

        if self.physical.gfx_level() != GfxLevel::Gfx8 {
            log::error!("the trap handler is only supported on GFX8");
            return Err(VkError::InitializationFailed);
        }

        let compiler = Arc::clone(self.physical.compiler());
        self.trap_handler = Some(TrapHandler::init(self.ws.as_ref(), compiler.as_ref())?);
        self.stages.push(InitStage::TrapHandler);
        Ok(())
    }

    fn init_force_vrs(&mut self) {
        let vrs = if let Some(path) = &self.config.force_vrs_config_file {
            ForceVrs::from_config_file(path)
        } else if let Some(rates) = &self.config.force_vrs {
            ForceVrs::from_rates(rates)
        } else {
            ForceVrs::disabled()
        };
        self.force_vrs = Some(vrs);
        self.stages.push(InitStage::ForceVrs);
    }

    fn init_meta(&mut self) -> Result<()> {
        let info = BoCreateInfo::new(
            META_ARENA_SIZE,
            4096,
            BoDomain::VRAM,
            BoFlags::CPU_ACCESS
                | BoFlags::NO_INTERPROCESS_SHARING
                | BoFlags::READ_ONLY
                | BoFlags::ADDR_32BIT,
        )
        .with_priority(BoPriority::SHADER);
        let bo = self.bo_create(&info, BoundObject::Device, true)?;
        self.meta = Some(MetaState { bo });
        self.stages.push(InitStage::Meta);
        Ok(())
    }

    fn init_border_color(&mut self) -> Result<()> {
        let info = BoCreateInfo::new(
            BORDER_COLOR_BUFFER_SIZE,
            4096,
            BoDomain::VRAM,
            BoFlags::CPU_ACCESS | BoFlags::READ_ONLY | BoFlags::NO_INTERPROCESS_SHARING,
        )
        .with_priority(BoPriority::SHADER);
        let bo = self
            .bo_create(&info, BoundObject::Device, true)
            .map_err(|_| VkError::OutOfDeviceMemory)?;
        let va = bo.va().raw();
        self.log_memory_trace(MemoryTraceToken::BorderColorPaletteCreate { va });

        if self.ws.buffer_make_resident(&bo, true).is_err() {
            self.log_memory_trace(MemoryTraceToken::BorderColorPaletteDestroy { va });
            self.bo_destroy(BoundObject::Device, bo);
            return Err(VkError::OutOfDeviceMemory);
        }

        let Some(mapping) = CpuMapping::map(self.ws.as_ref(), &bo) else {
            if self.ws.buffer_make_resident(&bo, false).is_err() {
                log::warn!("failed to evict the border color palette");
            }
            self.log_memory_trace(MemoryTraceToken::BorderColorPaletteDestroy { va });
            self.bo_destroy(BoundObject::Device, bo);
            return Err(VkError::OutOfDeviceMemory);
        };

        self.border_color = Some(BorderColor {
            bo,
            mapping,
            used: Mutex::new([0; BORDER_COLOR_COUNT / 64]),
        });
        self.stages.push(InitStage::BorderColor);
        Ok(())
    }

    fn init_vs_prologs(&mut self) -> Result<()> {
        let compiler = Arc::clone(self.physical.compiler());
        let base = VsPrologKey {
            instance_rate_inputs: 0,
            num_attributes: 0,
            next_stage: PrologNextStage::Vertex as u8,
            as_ls: 0,
            is_ngg: self.physical.use_ngg() as u8,
            wave32: (self.physical.ge_wave_size() == 32) as u8,
        };

        let mut simple = Vec::new();
        let mut instance_rate = Vec::new();

        if self.plan.precompile_vs_prologs {
            let build = |key: VsPrologKey| {
                compile_vs_prolog(compiler.as_ref(), &key)
                    .map(Arc::new)
                    .ok_or(VkError::OutOfDeviceMemory)
            };

            simple.reserve_exact(MAX_VERTEX_ATTRIBS as usize);
            for num in 1..=MAX_VERTEX_ATTRIBS {
                simple.push(build(VsPrologKey {
                    num_attributes: num,
                    ..base
                })?);
            }

            instance_rate.reserve_exact(NUM_INSTANCE_RATE_PROLOGS);
            for num in 1..=MAX_PRECOMPILED_INSTANCE_RATE_ATTRIBS {
                for count in 1..=num {
                    for start in 0..=(num - count) {
                        let mask = bit_consecutive(start, count);
                        debug_assert_eq!(instance_rate_prolog_index(num, mask), instance_rate.len());
                        instance_rate.push(build(VsPrologKey {
                            instance_rate_inputs: mask,
                            num_attributes: num,
                            ..base
                        })?);
                    }
                }
            }
            debug_assert_eq!(instance_rate.len(), NUM_INSTANCE_RATE_PROLOGS);
        }

        let cache = ShaderPartCache::new(move |key: &VsPrologKey| compile_vs_prolog(compiler.as_ref(), key));
        self.vs_prologs = Some(VsPrologs {
            base,
            simple,
            instance_rate,
            cache,
        });
        self.stages.push(InitStage::VsPrologs);
        Ok(())
    }

    fn init_perf_counters(&mut self) -> Result<()> {
        let info = BoCreateInfo::new(
            PERF_CTR_BO_SIZE,
            4096,
            BoDomain::GTT,
            BoFlags::CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING,
        )
        .with_priority(BoPriority::UPLOAD_BUFFER);
        let bo = self.bo_create(&info, BoundObject::Device, true)?;

        if self.physical.perf_counter_block_count() == 0 {
            log::error!("performance counters requested on a chip without counter blocks");
            self.bo_destroy(BoundObject::Device, bo);
            return Err(VkError::InitializationFailed);
        }

        self.perf_counters = Some(PerfCounters {
            bo,
            lock_cs: Mutex::new(vec![None; 2 * PERF_CTR_MAX_PASSES as usize]),
        });
        self.stages.push(InitStage::PerfCounters);
        Ok(())
    }

    fn finish_stage(&mut self, stage: InitStage) {
        let ws = Arc::clone(&self.ws);
        let ws = ws.as_ref();

        match stage {
            InitStage::HwCtx(priority) => {
                if let Some(ctx) = self.hw_ctx[priority.index()].take() {
                    ws.ctx_destroy(ctx);
                }
            }
            InitStage::Queues => self.queues.iter_mut().for_each(Vec::clear),
            InitStage::ShaderUploadQueue => {
                if let Some(ctx) = self.shader_upload_ctx.take() {
                    ws.ctx_destroy(ctx);
                }
            }
            InitStage::FaultTrace => {
                if let Some(trace) = self.fault_trace.take() {
                    trace.finish(ws);
                }
            }
            InitStage::ThreadTrace => {
                if let Some(trace) = self.thread_trace.take() {
                    trace.finish(ws);
                }
            }
            InitStage::Spm => {
                if let Some(spm) = self.spm.take() {
                    spm.finish(ws);
                }
            }
            InitStage::MemoryTrace => self.memory_trace = None,
            InitStage::TrapHandler => {
                if let Some(trap) = self.trap_handler.take() {
                    trap.finish(ws);
                }
            }
            InitStage::ForceVrs => {
                if let Some(vrs) = self.force_vrs.take() {
                    vrs.finish();
                }
            }
            InitStage::Meta => {
                if let Some(meta) = self.meta.take() {
                    self.bo_destroy(BoundObject::Device, meta.bo);
                }
            }
            InitStage::BorderColor => {
                if let Some(border) = self.border_color.take() {
                    let BorderColor { bo, mapping, .. } = border;
                    drop(mapping);
                    ws.buffer_unmap(&bo);
                    self.log_memory_trace(MemoryTraceToken::BorderColorPaletteDestroy {
                        va: bo.va().raw(),
                    });
                    if ws.buffer_make_resident(&bo, false).is_err() {
                        log::warn!("failed to evict the border color palette");
                    }
                    self.bo_destroy(BoundObject::Device, bo);
                }
            }
            InitStage::VsPrologs => {
                if let Some(prologs) = self.vs_prologs.take() {
                    prologs.cache.clear();
                }
            }
            InitStage::PsEpilogs => {
                if let Some(epilogs) = self.ps_epilogs.take() {
                    epilogs.clear();
                }
            }
            InitStage::GfxPreamble => {
                if let Some(preamble) = self.gfx_preamble.take() {
                    self.bo_destroy(BoundObject::Device, preamble.bo);
                }
            }
            InitStage::PipelineCache => self.pipeline_cache = None,
            InitStage::PerfCounters => {
                if let Some(perf) = self.perf_counters.take() {
                    self.bo_destroy(BoundObject::Device, perf.bo);
                }
            }
            InitStage::RraTrace => {
                if let Some(rra) = self.rra_trace.take() {
                    rra.finish(ws);
                }
            }
            InitStage::CaptureReplay => self.capture_replay = None,
            InitStage::Printf => {
                if let Some(printf) = self.printf.take() {
                    printf.finish(ws);
                }
            }
            InitStage::PstatePeak => self.release_profiling_lock(),
        }
    }

    fn teardown(&mut self) {
        self.finish_vrs_state();

        let scratch = self.compute_scratch.lock().take();
        if let Some(bo) = scratch {
            self.bo_destroy(BoundObject::Device, bo);
        }
        *self.ctx_roll.lock() = None;

        while let Some(stage) = self.stages.pop() {
            log::trace!("finishing {stage:?}");
            self.finish_stage(stage);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The GPU this device runs on
    pub fn physical(&self) -> &Arc<PhysicalDevice> {
        &self.physical
    }

    /// Configuration the device was created with
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Enabled features
    pub fn features(&self) -> &DeviceFeatures {
        &self.features
    }

    /// Subsystems chosen at creation
    pub fn plan(&self) -> &DeviceCreatePlan {
        &self.plan
    }

    /// Derived device state
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Resolved dispatch tables
    pub fn dispatch(&self) -> &DeviceDispatch {
        &self.dispatch
    }

    /// Completed creation stages, oldest first
    pub fn init_stages(&self) -> &[InitStage] {
        &self.stages
    }

    /// Shader cache key and its hash
    pub fn cache_key(&self) -> (&DeviceCacheKey, &[u8; 32]) {
        (&self.cache_key, &self.cache_hash)
    }

    /// Hardware context of `priority`, if a queue requested it
    pub fn hw_ctx(&self, priority: CtxPriority) -> Option<CtxHandle> {
        self.hw_ctx[priority.index()].as_ref().map(HwCtx::handle)
    }

    /// `vkGetDeviceQueue`
    pub fn get_queue(&self, family_index: u32, index: u32) -> Option<&Queue> {
        self.queues.get(family_index as usize)?.get(index as usize)
    }

    /// Queues created in `family_index`
    pub fn queue_count(&self, family_index: u32) -> usize {
        self.queues.get(family_index as usize).map_or(0, Vec::len)
    }

    /// Default MSAA sample positions
    pub fn sample_positions(&self) -> &SamplePositions {
        &self.sample_positions
    }

    /// Pipeline cache
    pub fn pipeline_cache(&self) -> Option<&PipelineCache> {
        self.pipeline_cache.as_ref()
    }

    /// Preamble address and length in dwords
    pub fn gfx_preamble(&self) -> Option<(u64, usize)> {
        self.gfx_preamble
            .as_ref()
            .map(|p| (p.bo.va().raw(), p.size_dw))
    }

    /// Hang debugging trace BO address
    pub fn trace_bo_va(&self) -> Option<u64> {
        self.fault_trace.as_ref().map(FaultTrace::va)
    }

    /// Shader printf buffer address
    pub fn printf_buffer_va(&self) -> Option<u64> {
        self.printf.as_ref().map(PrintfBuffer::va)
    }

    /// Thread trace bytes per shader engine
    pub fn thread_trace_buffer_size(&self) -> Option<u64> {
        self.thread_trace.as_ref().map(ThreadTrace::buffer_size)
    }

    /// A thread trace capture was requested
    pub fn thread_trace_pending(&self) -> bool {
        self.thread_trace.as_ref().is_some_and(ThreadTrace::is_triggered)
    }

    /// An RRA capture was requested
    pub fn rra_capture_pending(&self) -> bool {
        self.rra_trace.as_ref().is_some_and(RraTrace::is_triggered)
    }

    /// Track an acceleration structure for RRA captures
    pub fn rra_register_accel_struct(&self, handle: u64, va: u64) {
        if let Some(rra) = &self.rra_trace {
            rra.register_accel_struct(handle, va);
        }
    }

    // =========================================================================
    // Shader parts
    // =========================================================================

    /// VS prolog for `key`, precompiled or built on first use
    pub fn vs_prolog(&self, key: &VsPrologKey) -> Option<Arc<ShaderPart>> {
        self.vs_prologs.as_ref()?.lookup(key)
    }

    /// PS epilog for `key`, built on first use
    pub fn ps_epilog(&self, key: &PsEpilogKey) -> Option<Arc<ShaderPart>> {
        self.ps_epilogs.as_ref()?.get_or_create(key)
    }

    /// VS prologs built since creation, precompiled ones excluded
    pub fn vs_prolog_cache_len(&self) -> usize {
        self.vs_prologs.as_ref().map_or(0, |p| p.cache.len())
    }

    // =========================================================================
    // Border colors
    // =========================================================================

    /// Reserve a palette slot holding `color`
    pub fn register_border_color(&self, color: [u32; 4]) -> Option<u32> {
        let border = self.border_color.as_ref()?;
        let mut used = border.used.lock();

        let (word, bit) = used
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| (i, w.trailing_ones() as usize))?;
        used[word] |= 1 << bit;

        let slot = word * 64 + bit;
        border
            .mapping
            .write(slot * BORDER_COLOR_SIZE, bytemuck::cast_slice(&color));
        Some(slot as u32)
    }

    /// Release a slot from [`Device::register_border_color`]
    pub fn unregister_border_color(&self, slot: u32) {
        let Some(border) = &self.border_color else {
            return;
        };
        let slot = slot as usize;
        if slot >= BORDER_COLOR_COUNT {
            return;
        }
        border.used.lock()[slot / 64] &= !(1 << (slot % 64));
    }

    /// Palette address
    pub fn border_color_va(&self) -> Option<u64> {
        self.border_color.as_ref().map(|b| b.bo.va().raw())
    }

    // =========================================================================
    // Performance counters
    // =========================================================================

    /// Stream taking (`unlock == false`) or releasing a counter pass
    pub fn perf_counter_lock_cs(&self, pass: u32, unlock: bool) -> Option<CmdStream> {
        let perf = self.perf_counters.as_ref()?;
        if pass >= PERF_CTR_MAX_PASSES {
            return None;
        }

        let slot = pass as usize * 2 + unlock as usize;
        let mut streams = perf.lock_cs.lock();
        let cs = streams[slot]
            .get_or_insert_with(|| build_perf_counter_lock_cs(perf.bo.va().raw(), pass, unlock));
        Some(cs.clone())
    }

    /// Address the GPU signals once counters are sampled
    pub fn perf_counter_fence_va(&self) -> Option<u64> {
        self.perf_counters
            .as_ref()
            .map(|p| p.bo.va().raw() + PERF_CTR_BO_FENCE_OFFSET)
    }

    // =========================================================================
    // Ray tracing handles
    // =========================================================================

    /// Record the stages behind a shader group handle
    ///
    /// Returns false when the handle is already taken by different stages.
    pub fn register_rt_group_handle(&self, handle: u32, stages_hash: [u8; 32]) -> bool {
        let mut handles = self.rt_handles.lock();
        match handles.get(&handle) {
            Some(existing) => *existing == stages_hash,
            None => {
                handles.insert(handle, stages_hash);
                true
            }
        }
    }

    /// Remember the address an object was captured at
    pub fn record_capture_replay_va(&self, handle: u64, va: u64) -> bool {
        match &self.capture_replay {
            Some(table) => {
                table.lock().insert(handle, va);
                true
            }
            None => false,
        }
    }

    /// Captured address of `handle`
    pub fn capture_replay_va(&self, handle: u64) -> Option<u64> {
        self.capture_replay.as_ref()?.lock().get(&handle).copied()
    }

    // =========================================================================
    // Compute scratch
    // =========================================================================

    /// Make sure compute scratch covers `bytes_per_wave` for every wave
    ///
    /// Returns the scratch address. The buffer only ever grows.
    pub fn ensure_compute_scratch(&self, bytes_per_wave: u64) -> Result<u64> {
        let size = bytes_per_wave
            .checked_mul(u64::from(self.state.scratch_waves))
            .ok_or(VkError::OutOfDeviceMemory)?;
        let mut scratch = self.compute_scratch.lock();
        if let Some(bo) = scratch.as_ref() {
            if bo.size() >= size {
                return Ok(bo.va().raw());
            }
        }

        let info = BoCreateInfo::new(
            size.max(4096),
            4096,
            BoDomain::VRAM,
            BoFlags::NO_CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING,
        )
        .with_priority(BoPriority::SCRATCH);
        let bo = self.bo_create(&info, BoundObject::Device, true)?;
        let va = bo.va().raw();
        if let Some(old) = scratch.replace(bo) {
            self.bo_destroy(BoundObject::Device, old);
        }
        Ok(va)
    }

    // =========================================================================
    // Captures
    // =========================================================================

    /// Start every capture the enabled trace modes provide
    ///
    /// RRA and RGP captures are picked up by the next submission. The memory
    /// trace is drained. With context roll tracing a new log file is opened
    /// in the capture directory.
    pub fn capture_trace(&self) {
        if let Some(rra) = &self.rra_trace {
            rra.trigger();
        }

        if let Some(trace) = &self.memory_trace {
            let _guard = self.trace_lock.lock();
            let tokens = trace.dump();
            log::info!("RMV capture: {} tokens", tokens.len());
        }

        if let Some(thread_trace) = &self.thread_trace {
            thread_trace.trigger();
        }

        if self.plan.ctx_roll {
            let mut roll = self.ctx_roll.lock();
            if roll.is_none() {
                let path = self
                    .config
                    .capture_dir
                    .join(format!("{}_{}.ctxroll", process_name(), capture_timestamp()));
                match File::create(&path) {
                    Ok(file) => {
                        log::info!("Writing context rolls to '{}'...", path.display());
                        *roll = Some(CtxRollLog { path, file });
                    }
                    Err(err) => log::error!("failed to open '{}': {err}", path.display()),
                }
            }
        }
    }

    /// Path of the open context roll log
    pub fn ctx_roll_path(&self) -> Option<PathBuf> {
        self.ctx_roll.lock().as_ref().map(|roll| roll.path.clone())
    }

    /// Append a line to the open context roll log
    pub fn log_ctx_roll(&self, line: &str) -> bool {
        let mut roll = self.ctx_roll.lock();
        let Some(roll) = roll.as_mut() else {
            return false;
        };
        match writeln!(roll.file, "{line}") {
            Ok(()) => true,
            Err(err) => {
                log::warn!("failed to write context roll log: {err}");
                false
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("family", &self.physical.info().family)
            .field("plan", &self.plan)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

fn build_dispatch(config: &DriverConfig, plan: &DeviceCreatePlan) -> DeviceDispatch {
    let mut builder = DispatchBuilder::new();
    if plan.annotate {
        builder.add_layer(Provider::Annotate, DispatchTable::Annotate);
    }
    if let Some(layer) = config.options.app_layer {
        builder.add_layer(Provider::App(layer), DispatchTable::App);
    }
    if plan.thread_trace {
        builder.add_layer(Provider::Rgp, DispatchTable::Rgp);
    }
    if plan.rra_trace {
        builder.add_layer(Provider::Rra, DispatchTable::Rra);
    }
    if plan.memory_trace {
        builder.add_layer(Provider::Rmv, DispatchTable::Rmv);
    }
    if plan.ctx_roll {
        builder.add_layer(Provider::CtxRoll, DispatchTable::CtxRoll);
    }
    builder
        .add_driver(Provider::Driver)
        .add_driver(Provider::Wsi)
        .add_driver(Provider::Common)
        .build()
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "ember".to_string())
}

/// Local time as `YYYY.MM.DD_HH.MM.SS`
fn capture_timestamp() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let t = libc::time_t::try_from(secs).unwrap_or(0);

    // SAFETY: `tm` is plain data; all-zero is a valid value.
    let mut tm: libc::tm = unsafe { core::mem::zeroed() };
    // SAFETY: both pointers are valid for the duration of the call.
    if unsafe { libc::localtime_r(&t, &mut tm) }.is_null() {
        return secs.to_string();
    }
    format!(
        "{:04}.{:02}.{:02}_{:02}.{:02}.{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}

// =============================================================================
// vkCreateDevice / vkDestroyDevice
// =============================================================================

/// `vkCreateDevice`
pub fn create_device(
    physical: &Arc<PhysicalDevice>,
    config: &DriverConfig,
    info: &DeviceCreateInfo,
) -> Result<Device> {
    Device::create(Arc::clone(physical), config, info)
}

/// `vkDestroyDevice`; `None` is a no-op
pub fn destroy_device(device: Option<Device>) {
    if let Some(device) = device {
        log::debug!("destroying device with {} init stages", device.stages.len());
        drop(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{ChipFamily, ChipInfo};
    use ember_winsys::NullWinsys;

    fn physical(family: ChipFamily) -> (Arc<NullWinsys>, Arc<PhysicalDevice>) {
        let ws = Arc::new(NullWinsys::new());
        let physical = PhysicalDevice::new(ws.clone(), ChipInfo::for_family(family));
        (ws, Arc::new(physical))
    }

    #[test]
    fn test_plan_defaults() {
        let (_, pd) = physical(ChipFamily::Navi21);
        let plan = DeviceCreatePlan::new(&pd, &DriverConfig::default(), &DeviceCreateInfo::new());
        assert!(plan.gfx_preamble);
        assert!(!plan.fault_detection);
        assert!(!plan.vs_prologs);
        assert!(!plan.printf);
        assert!(!plan.force_vrs);
    }

    #[test]
    fn test_plan_pstate_peak_only_gfx11_dgpu() {
        let mut config = DriverConfig::default();
        config.options.force_pstate_peak_gfx11_dgpu = true;
        let info = DeviceCreateInfo::new();

        let (_, navi31) = physical(ChipFamily::Navi31);
        let (_, phoenix) = physical(ChipFamily::Gfx1103R1);
        let (_, gfx1150) = physical(ChipFamily::Gfx1150);
        assert!(DeviceCreatePlan::new(&navi31, &config, &info).pstate_peak);
        assert!(!DeviceCreatePlan::new(&phoenix, &config, &info).pstate_peak);
        assert!(!DeviceCreatePlan::new(&gfx1150, &config, &info).pstate_peak);
    }

    #[test]
    fn test_state_dxvk_trunc_coord() {
        let (_, pd) = physical(ChipFamily::Navi21);
        let mut config = DriverConfig::default();
        config.app.engine_name = "DXVK".to_string();
        config.app.engine_version = make_api_version(2, 2, 0);

        let mut info = DeviceCreateInfo::new();
        let plan = DeviceCreatePlan::new(&pd, &config, &info);

        // Without dual source blending an old DXVK is running D3D9.
        assert!(!DeviceState::new(&pd, &config, &info, &plan).disable_trunc_coord);
        info.features.dual_src_blend = true;
        assert!(DeviceState::new(&pd, &config, &info, &plan).disable_trunc_coord);

        config.app.engine_version = make_api_version(2, 4, 0);
        config.app.app_version = 1;
        assert!(!DeviceState::new(&pd, &config, &info, &plan).disable_trunc_coord);
        config.app.app_version = 2;
        assert!(DeviceState::new(&pd, &config, &info, &plan).disable_trunc_coord);

        config.app.engine_name = "vkd3d".to_string();
        config.app.app_version = 1;
        assert!(DeviceState::new(&pd, &config, &info, &plan).disable_trunc_coord);
    }

    #[test]
    fn test_state_dispatch_initiator() {
        let config = DriverConfig::default();
        let info = DeviceCreateInfo::new();
        let state = |family| {
            let (_, pd) = physical(family);
            let plan = DeviceCreatePlan::new(&pd, &config, &info);
            DeviceState::new(&pd, &config, &info, &plan)
        };

        assert_eq!(state(ChipFamily::Tahiti).dispatch_initiator, 0x1);
        assert_eq!(state(ChipFamily::Hawaii).dispatch_initiator, 0x9);
        let navi = state(ChipFamily::Navi10);
        assert_eq!(navi.dispatch_initiator, 0x2009);
        assert_eq!(navi.dispatch_initiator_task, 0x2409);
        assert!(!navi.load_grid_size_from_user_sgpr);
        assert!(state(ChipFamily::Navi21).load_grid_size_from_user_sgpr);
    }

    #[test]
    fn test_state_robustness_and_aniso() {
        let (_, pd) = physical(ChipFamily::Vega10);
        let mut config = DriverConfig::default();
        config.tex_aniso = 64;
        let mut info = DeviceCreateInfo::new();
        info.features.robust_buffer_access = true;
        let plan = DeviceCreatePlan::new(&pd, &config, &info);
        let state = DeviceState::new(&pd, &config, &info, &plan);
        assert_eq!(state.buffer_robustness, BufferRobustness::Robust);
        assert_eq!(state.force_aniso, 16);
        assert!(state.pbb_allowed);

        info.features.robust_buffer_access2 = true;
        let state = DeviceState::new(&pd, &config, &info, &plan);
        assert_eq!(state.buffer_robustness, BufferRobustness::Robust2);
    }

    #[test]
    fn test_cache_key_shader_object() {
        let (_, vega) = physical(ChipFamily::Vega10);
        let (_, navi) = physical(ChipFamily::Navi21);
        let state = DeviceState::default();
        let features = DeviceFeatures {
            shader_object: true,
            ..DeviceFeatures::default()
        };

        let key = DeviceCacheKey::new(&vega, &features, &state);
        assert_eq!(key.image_2d_view_of_3d, 1);
        assert_eq!(key.primitives_generated_query, 1);
        assert_eq!(DeviceCacheKey::new(&navi, &features, &state).image_2d_view_of_3d, 0);
    }

    #[test]
    fn test_hw_ctx_shared_per_priority() {
        let (ws, pd) = physical(ChipFamily::Navi21);
        let info = DeviceCreateInfo::new().with_queues(&[
            DeviceQueueCreateInfo::new(0, 1),
            DeviceQueueCreateInfo::new(1, 2),
            DeviceQueueCreateInfo::new(1, 1).with_priority(CtxPriority::High),
        ]);
        let device = Device::create(pd, &DriverConfig::default(), &info).unwrap();

        assert_eq!(ws.live_ctx_count(), 2);
        assert_eq!(device.queue_count(1), 3);
        let q0 = device.get_queue(0, 0).unwrap();
        let q1 = device.get_queue(1, 0).unwrap();
        let q2 = device.get_queue(1, 2).unwrap();
        assert_eq!(q0.ctx(), q1.ctx());
        assert_ne!(q1.ctx(), q2.ctx());
        assert_eq!(q2.priority(), CtxPriority::High);
        assert_eq!(q2.family(), QueueFamily::Compute);

        destroy_device(Some(device));
        assert_eq!(ws.live_ctx_count(), 0);
    }

    #[test]
    fn test_too_many_queues_fails() {
        let (ws, pd) = physical(ChipFamily::Navi21);
        let info = DeviceCreateInfo::new().with_queues(&[DeviceQueueCreateInfo::new(0, 2)]);
        let err = Device::create(pd, &DriverConfig::default(), &info).unwrap_err();
        assert_eq!(err, VkError::InitializationFailed);
        assert_eq!(ws.live_ctx_count(), 0);
    }

    #[test]
    fn test_vs_prolog_precompiled_lookup() {
        let (_, pd) = physical(ChipFamily::Navi21);
        let info = DeviceCreateInfo::new().with_features(DeviceFeatures {
            vertex_input_dynamic_state: true,
            ..DeviceFeatures::default()
        });
        let device = Device::create(pd, &DriverConfig::default(), &info).unwrap();
        let base = device.vs_prologs.as_ref().unwrap().base;

        let key = VsPrologKey {
            num_attributes: 4,
            instance_rate_inputs: 0b0110,
            ..base
        };
        let a = device.vs_prolog(&key).unwrap();
        let b = device.vs_prolog(&key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(device.vs_prolog_cache_len(), 0);

        // Non-consecutive masks are built on demand.
        let key = VsPrologKey {
            num_attributes: 4,
            instance_rate_inputs: 0b0101,
            ..base
        };
        device.vs_prolog(&key).unwrap();
        assert_eq!(device.vs_prolog_cache_len(), 1);
    }

    #[test]
    fn test_border_color_slots() {
        let (ws, pd) = physical(ChipFamily::Navi21);
        let info = DeviceCreateInfo::new().with_features(DeviceFeatures {
            custom_border_colors: true,
            ..DeviceFeatures::default()
        });
        let device = Device::create(pd, &DriverConfig::default(), &info).unwrap();

        assert_eq!(device.register_border_color([1, 2, 3, 4]), Some(0));
        assert_eq!(device.register_border_color([5, 6, 7, 8]), Some(1));
        device.unregister_border_color(0);
        assert_eq!(device.register_border_color([9, 9, 9, 9]), Some(0));

        let bo = device.border_color.as_ref().unwrap().bo.handle();
        let contents = ws.bo_contents(bo).unwrap();
        let words: &[u32] = bytemuck::cast_slice(&contents[..32]);
        assert_eq!(words, &[9, 9, 9, 9, 5, 6, 7, 8]);
    }

    #[test]
    fn test_perf_counter_lock_cs() {
        let (_, pd) = physical(ChipFamily::Navi21);
        let info = DeviceCreateInfo::new().with_features(DeviceFeatures {
            performance_counter_query_pools: true,
            ..DeviceFeatures::default()
        });
        let device = Device::create(pd, &DriverConfig::default(), &info).unwrap();
        let fence = device.perf_counter_fence_va().unwrap();

        let lock = device.perf_counter_lock_cs(3, false).unwrap();
        let dw = lock.as_slice();
        assert_eq!(dw[0], pkt3(opcode::WRITE_DATA, 3, false));
        assert_eq!(u64::from(dw[2]) | (u64::from(dw[3]) << 32), fence + 16 + 24);
        assert_eq!(dw[4], 1);
        assert_eq!(device.perf_counter_lock_cs(3, true).unwrap().as_slice()[4], 0);
        assert!(device.perf_counter_lock_cs(PERF_CTR_MAX_PASSES, false).is_none());
    }

    #[test]
    fn test_rt_group_handle_collisions() {
        let (_, pd) = physical(ChipFamily::Navi21);
        let device = Device::create(pd, &DriverConfig::default(), &DeviceCreateInfo::new()).unwrap();
        assert!(device.register_rt_group_handle(7, [1; 32]));
        assert!(device.register_rt_group_handle(7, [1; 32]));
        assert!(!device.register_rt_group_handle(7, [2; 32]));
        assert!(!device.record_capture_replay_va(1, 0x1000));
    }

    #[test]
    fn test_compute_scratch_grows() {
        let (ws, pd) = physical(ChipFamily::Navi21);
        let device = Device::create(pd, &DriverConfig::default(), &DeviceCreateInfo::new()).unwrap();
        let live = ws.live_bo_count();

        let a = device.ensure_compute_scratch(1024).unwrap();
        assert_eq!(device.ensure_compute_scratch(512).unwrap(), a);
        device.ensure_compute_scratch(4096).unwrap();
        assert_eq!(ws.live_bo_count(), live + 1);

        assert_eq!(device.ensure_compute_scratch(u64::MAX), Err(VkError::OutOfDeviceMemory));
        assert_eq!(ws.live_bo_count(), live + 1);

        drop(device);
        assert_eq!(ws.live_bo_count(), 0);
    }
}
