//! # Driver Configuration
//!
//! Every environment switch the driver honours, read once into a
//! [`DriverConfig`] and passed by reference into device creation.
//!
//! ```text
//! EMBER_DEBUG                   hang,nocache,noibs,nobinning,...
//! EMBER_PERFTEST                bolist,dmashaders,rtemulation
//! EMBER_TRACE                   rgp,rmv,rra,ctxroll
//! EMBER_THREAD_TRACE_BUFFER_SIZE, EMBER_THREAD_TRACE_CACHE_COUNTERS
//! EMBER_TRAP_HANDLER            any value enables
//! EMBER_FORCE_VRS               2x2 | 2x1 | 1x2 | 1x1
//! EMBER_FORCE_VRS_CONFIG_FILE   path, watched for changes
//! EMBER_TEX_ANISO               forced anisotropy, -1 = off
//! EMBER_PRINTF_BUFFER_SIZE      bytes, 0 = off
//! EMBER_APP_LAYER               metroexodus | rage2 | quanticdream
//! EMBER_CAPTURE_DIR             where trace captures land, default /tmp
//! ```

use std::path::PathBuf;

// =============================================================================
// FLAG SETS
// =============================================================================

bitflags::bitflags! {
    /// `EMBER_DEBUG` options
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct DebugFlags: u32 {
        /// GPU hang detection: trace BO, synchronous shaders, kept shader info
        const HANG = 1 << 0;
        /// Disable the pipeline cache
        const NO_CACHE = 1 << 1;
        /// Do not use a preamble IB
        const NO_IBS = 1 << 2;
        /// Disable primitive binning
        const NO_BINNING = 1 << 3;
        /// Disable fast color clears
        const NO_FAST_CLEARS = 1 << 4;
        /// Compile VS prologs on demand so they can be dumped
        const DUMP_PROLOGS = 1 << 5;
        /// Force register shadowing
        const SHADOW_REGS = 1 << 6;
        /// Wait for idle after every draw and dispatch
        const SYNC_SHADERS = 1 << 7;
        /// Keep shader metadata for debugging tools
        const SHADER_INFO = 1 << 8;
    }
}

bitflags::bitflags! {
    /// `EMBER_PERFTEST` options
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PerftestFlags: u32 {
        /// Always submit with a global BO list
        const BO_LIST = 1 << 0;
        /// Upload shaders to invisible VRAM through a DMA queue
        const DMA_SHADERS = 1 << 1;
        /// Expose ray tracing on chips without hardware support
        const RT_EMULATION = 1 << 2;
    }
}

bitflags::bitflags! {
    /// `EMBER_TRACE` capture modes
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct TraceMode: u32 {
        /// Radeon GPU Profiler thread traces
        const RGP = 1 << 0;
        /// Radeon Memory Visualizer memory trace
        const RMV = 1 << 1;
        /// Radeon Raytracing Analyzer captures
        const RRA = 1 << 2;
        /// Context roll logging
        const CTX_ROLL = 1 << 3;
    }
}

const DEBUG_OPTIONS: &[(&str, DebugFlags)] = &[
    ("hang", DebugFlags::HANG),
    ("nocache", DebugFlags::NO_CACHE),
    ("noibs", DebugFlags::NO_IBS),
    ("nobinning", DebugFlags::NO_BINNING),
    ("nofastclears", DebugFlags::NO_FAST_CLEARS),
    ("dumpprologs", DebugFlags::DUMP_PROLOGS),
    ("shadowregs", DebugFlags::SHADOW_REGS),
    ("syncshaders", DebugFlags::SYNC_SHADERS),
    ("shaderinfo", DebugFlags::SHADER_INFO),
];

const PERFTEST_OPTIONS: &[(&str, PerftestFlags)] = &[
    ("bolist", PerftestFlags::BO_LIST),
    ("dmashaders", PerftestFlags::DMA_SHADERS),
    ("rtemulation", PerftestFlags::RT_EMULATION),
];

const TRACE_OPTIONS: &[(&str, TraceMode)] = &[
    ("rgp", TraceMode::RGP),
    ("rmv", TraceMode::RMV),
    ("rra", TraceMode::RRA),
    ("ctxroll", TraceMode::CTX_ROLL),
];

/// Parse a comma separated option list; unknown names are ignored
fn parse_flags<F: bitflags::Flags + Copy>(value: Option<&str>, table: &[(&str, F)]) -> F {
    let mut flags = F::empty();
    let Some(value) = value else {
        return flags;
    };
    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        match table.iter().find(|(option, _)| option.eq_ignore_ascii_case(name)) {
            Some((_, flag)) => flags.insert(*flag),
            None => log::warn!("ignoring unknown option '{name}'"),
        }
    }
    flags
}

// =============================================================================
// APPLICATION WORKAROUNDS
// =============================================================================

/// Per-application entry point overrides
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AppLayer {
    /// Metro Exodus
    MetroExodus,
    /// Rage 2
    Rage2,
    /// Quantic Dream titles
    QuanticDream,
}

impl AppLayer {
    /// Parse the layer name used in driver configuration files
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "metroexodus" => Some(Self::MetroExodus),
            "rage2" => Some(Self::Rage2),
            "quanticdream" => Some(Self::QuanticDream),
            _ => None,
        }
    }
}

/// Per-application driver options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverOptions {
    /// Entry point override layer
    pub app_layer: Option<AppLayer>,
    /// Hold the peak power state for the lifetime of GFX11 dGPU devices
    pub force_pstate_peak_gfx11_dgpu: bool,
    /// Disable texture coordinate truncation for non-D3D9 content
    pub disable_trunc_coord: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            app_layer: None,
            force_pstate_peak_gfx11_dgpu: false,
            disable_trunc_coord: true,
        }
    }
}

/// Application identity from instance creation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppInfo {
    /// Engine name, e.g. `"DXVK"`
    pub engine_name: String,
    /// Engine version, packed with [`make_api_version`]
    pub engine_version: u32,
    /// Application version
    pub app_version: u32,
}

/// Pack a version the way `VK_MAKE_VERSION` does
pub const fn make_api_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 22) | (minor << 12) | patch
}

// =============================================================================
// DRIVER CONFIG
// =============================================================================

/// Default thread trace buffer size per shader engine
pub const DEFAULT_THREAD_TRACE_BUFFER_SIZE: u64 = 32 * 1024 * 1024;

/// Default ray history buffer size for RRA captures
pub const DEFAULT_RRA_HISTORY_SIZE: u64 = 64 * 1024 * 1024;

/// Snapshot of every driver switch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    /// Debug options
    pub debug: DebugFlags,
    /// Experimental performance options
    pub perftest: PerftestFlags,
    /// Enabled capture tools
    pub trace: TraceMode,
    /// Thread trace buffer bytes per shader engine
    pub thread_trace_buffer_size: u64,
    /// Collect cache counters alongside thread traces (SPM)
    pub thread_trace_cache_counters: bool,
    /// Ray history buffer bytes for RRA
    pub rra_history_size: u64,
    /// Install the shader trap handler
    pub trap_handler: bool,
    /// Forced per-vertex VRS rate string
    pub force_vrs: Option<String>,
    /// File holding the forced VRS rate, re-read on change
    pub force_vrs_config_file: Option<PathBuf>,
    /// Forced anisotropy, negative when unset
    pub tex_aniso: i32,
    /// Shader printf buffer bytes, 0 when disabled
    pub printf_buffer_size: u32,
    /// Per-application options
    pub options: DriverOptions,
    /// Application identity
    pub app: AppInfo,
    /// Directory capture files are written to
    pub capture_dir: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            debug: DebugFlags::empty(),
            perftest: PerftestFlags::empty(),
            trace: TraceMode::empty(),
            thread_trace_buffer_size: DEFAULT_THREAD_TRACE_BUFFER_SIZE,
            thread_trace_cache_counters: true,
            rra_history_size: DEFAULT_RRA_HISTORY_SIZE,
            trap_handler: false,
            force_vrs: None,
            force_vrs_config_file: None,
            tex_aniso: -1,
            printf_buffer_size: 0,
            options: DriverOptions::default(),
            app: AppInfo::default(),
            capture_dir: PathBuf::from("/tmp"),
        }
    }
}

impl DriverConfig {
    /// Read the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<i64>().ok());

        Self {
            debug: parse_flags(lookup("EMBER_DEBUG").as_deref(), DEBUG_OPTIONS),
            perftest: parse_flags(lookup("EMBER_PERFTEST").as_deref(), PERFTEST_OPTIONS),
            trace: parse_flags(lookup("EMBER_TRACE").as_deref(), TRACE_OPTIONS),
            thread_trace_buffer_size: number("EMBER_THREAD_TRACE_BUFFER_SIZE")
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(defaults.thread_trace_buffer_size),
            thread_trace_cache_counters: lookup("EMBER_THREAD_TRACE_CACHE_COUNTERS")
                .map_or(defaults.thread_trace_cache_counters, |v| parse_bool(&v)),
            rra_history_size: number("EMBER_RRA_TRACE_HISTORY_SIZE")
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(defaults.rra_history_size),
            trap_handler: lookup("EMBER_TRAP_HANDLER").is_some(),
            force_vrs: lookup("EMBER_FORCE_VRS"),
            force_vrs_config_file: lookup("EMBER_FORCE_VRS_CONFIG_FILE").map(PathBuf::from),
            tex_aniso: number("EMBER_TEX_ANISO")
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(defaults.tex_aniso),
            printf_buffer_size: number("EMBER_PRINTF_BUFFER_SIZE")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.printf_buffer_size),
            options: DriverOptions {
                app_layer: lookup("EMBER_APP_LAYER").and_then(|v| AppLayer::from_name(&v)),
                ..defaults.options
            },
            app: defaults.app,
            capture_dir: lookup("EMBER_CAPTURE_DIR").map_or(defaults.capture_dir, PathBuf::from),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn config(vars: &[(&str, &str)]) -> DriverConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DriverConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_empty_environment_is_default() {
        assert_eq!(config(&[]), DriverConfig::default());
    }

    #[test]
    fn test_flag_lists() {
        let cfg = config(&[
            ("EMBER_DEBUG", "hang, noibs,bogus"),
            ("EMBER_PERFTEST", "dmashaders"),
            ("EMBER_TRACE", "rgp,ctxroll"),
        ]);
        assert_eq!(cfg.debug, DebugFlags::HANG | DebugFlags::NO_IBS);
        assert_eq!(cfg.perftest, PerftestFlags::DMA_SHADERS);
        assert_eq!(cfg.trace, TraceMode::RGP | TraceMode::CTX_ROLL);
    }

    #[test]
    fn test_numbers_and_paths() {
        let cfg = config(&[
            ("EMBER_TEX_ANISO", "8"),
            ("EMBER_PRINTF_BUFFER_SIZE", "65536"),
            ("EMBER_FORCE_VRS_CONFIG_FILE", "/tmp/vrs"),
            ("EMBER_THREAD_TRACE_CACHE_COUNTERS", "false"),
            ("EMBER_TRAP_HANDLER", ""),
            ("EMBER_APP_LAYER", "rage2"),
            ("EMBER_CAPTURE_DIR", "/var/tmp/ember"),
        ]);
        assert_eq!(cfg.tex_aniso, 8);
        assert_eq!(cfg.printf_buffer_size, 65536);
        assert_eq!(cfg.force_vrs_config_file, Some(PathBuf::from("/tmp/vrs")));
        assert!(!cfg.thread_trace_cache_counters);
        assert!(cfg.trap_handler);
        assert_eq!(cfg.options.app_layer, Some(AppLayer::Rage2));
        assert_eq!(cfg.capture_dir, PathBuf::from("/var/tmp/ember"));
    }

    #[test]
    fn test_malformed_numbers_keep_defaults() {
        let cfg = config(&[("EMBER_TEX_ANISO", "lots"), ("EMBER_PRINTF_BUFFER_SIZE", "-1")]);
        assert_eq!(cfg.tex_aniso, -1);
        assert_eq!(cfg.printf_buffer_size, 0);
    }

    #[test]
    fn test_make_api_version() {
        assert_eq!(make_api_version(2, 3, 0), (2 << 22) | (3 << 12));
        assert!(make_api_version(2, 3, 1) > make_api_version(2, 3, 0));
    }
}
