//! # Shader Parts
//!
//! Small shader fragments (VS prologs, PS epilogs) compiled from a key and
//! shared by every pipeline that needs the same key.
//!
//! ```text
//!   key ──► ShaderPartCache ──hit──► Arc<ShaderPart>
//!               │ miss
//!               ▼
//!           factory(key) ──► ShaderCompiler
//! ```
//!
//! The cache is generic over key and value. The factory is injected at
//! construction so the device decides which compiler backs each cache.

use std::hash::Hash;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use spin::RwLock;

// =============================================================================
// KEYS
// =============================================================================

/// Maximum vertex input attributes
pub const MAX_VERTEX_ATTRIBS: u32 = 32;

/// Attribute count up to which instance-rate prologs are precompiled
pub const MAX_PRECOMPILED_INSTANCE_RATE_ATTRIBS: u32 = 16;

/// Number of precompiled instance-rate prologs
pub const NUM_INSTANCE_RATE_PROLOGS: usize = 816;

/// Stage that runs after a VS prolog
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PrologNextStage {
    /// Vertex shader
    Vertex = 0,
    /// Tessellation control shader (merged LS)
    TessCtrl = 1,
    /// Geometry shader (merged ES)
    Geometry = 2,
}

/// Key of a vertex shader prolog
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct VsPrologKey {
    /// Attributes fetched per instance instead of per vertex
    pub instance_rate_inputs: u32,
    /// Number of vertex attributes
    pub num_attributes: u32,
    /// [`PrologNextStage`] as u8
    pub next_stage: u8,
    /// Runs as LS
    pub as_ls: u8,
    /// Next stage runs on the NGG pipeline
    pub is_ngg: u8,
    /// Compiled for wave32
    pub wave32: u8,
}

/// Key of a fragment shader epilog
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct PsEpilogKey {
    /// SPI_SHADER_COL_FORMAT
    pub spi_shader_col_format: u32,
    /// Bitmask of 8-bit integer render targets
    pub color_is_int8: u8,
    /// Bitmask of 10-bit integer render targets
    pub color_is_int10: u8,
    /// Dual source blending on MRT0
    pub mrt0_is_dual_src: u8,
    /// Export alpha for alpha-to-coverage
    pub alpha_to_coverage_via_mrtz: u8,
    /// Bitmask of written render targets
    pub colors_written: u32,
}

static_assertions::assert_eq_size!(VsPrologKey, [u32; 3]);
static_assertions::assert_eq_size!(PsEpilogKey, [u32; 3]);

/// Index of a precompiled instance-rate prolog
///
/// Prologs are ordered by total attribute count, then by instance-rate
/// attribute count, then by first instance-rate attribute. Only consecutive
/// masks within the first [`MAX_PRECOMPILED_INSTANCE_RATE_ATTRIBS`] attributes
/// have a slot.
pub fn instance_rate_prolog_index(num_attributes: u32, instance_rate_inputs: u32) -> usize {
    const TOTAL_TO_OFFSET: [u16; 16] = [
        0, 1, 4, 10, 20, 35, 56, 84, 120, 165, 220, 286, 364, 455, 560, 680,
    ];
    // Offsets for 16 attributes; fewer attributes shrink each group by one
    // per preceding count.
    const COUNT_TO_OFFSET_TOTAL16: [u16; 16] = [
        0, 16, 31, 45, 58, 70, 81, 91, 100, 108, 115, 121, 126, 130, 133, 135,
    ];

    debug_assert!((1..=MAX_PRECOMPILED_INSTANCE_RATE_ATTRIBS).contains(&num_attributes));
    debug_assert!(is_consecutive_mask(instance_rate_inputs));

    let start_index = TOTAL_TO_OFFSET[num_attributes as usize - 1] as usize;
    let count = instance_rate_inputs.count_ones();
    let offset_from_start = COUNT_TO_OFFSET_TOTAL16[count as usize - 1] as usize
        - ((16 - num_attributes) * (count - 1)) as usize;
    let first = instance_rate_inputs.trailing_zeros() as usize;
    start_index + offset_from_start + first
}

/// `count` set bits starting at bit `start`
pub const fn bit_consecutive(start: u32, count: u32) -> u32 {
    if count >= 32 {
        u32::MAX << start
    } else {
        ((1u32 << count) - 1) << start
    }
}

/// Non-empty run of consecutive set bits
pub const fn is_consecutive_mask(mask: u32) -> bool {
    mask != 0 && {
        let shifted = mask >> mask.trailing_zeros();
        shifted & (shifted.wrapping_add(1)) == 0
    }
}

// =============================================================================
// COMPILER
// =============================================================================

/// Machine code of a compiled shader part
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderBinary {
    /// Instruction dwords
    pub code: Vec<u32>,
}

/// A compiled and cached shader part
#[derive(Debug, PartialEq, Eq)]
pub struct ShaderPart {
    /// Machine code
    pub binary: ShaderBinary,
    /// BLAKE3 of the key the part was compiled for
    pub key_hash: [u8; 32],
}

impl ShaderPart {
    /// Wrap a binary compiled for `key`
    pub fn new<K: Pod>(key: &K, binary: ShaderBinary) -> Self {
        Self {
            binary,
            key_hash: *blake3::hash(bytemuck::bytes_of(key)).as_bytes(),
        }
    }
}

/// Backend that turns shader part keys into machine code
///
/// `None` means the part could not be built; callers report it as device
/// memory exhaustion.
pub trait ShaderCompiler: Send + Sync {
    /// Compile a VS prolog
    fn compile_vs_prolog(&self, key: &VsPrologKey) -> Option<ShaderBinary>;

    /// Compile a PS epilog
    fn compile_ps_epilog(&self, key: &PsEpilogKey) -> Option<ShaderBinary>;

    /// Compile the shader trap handler
    fn compile_trap_handler(&self) -> Option<ShaderBinary>;
}

/// `s_nop 0`
const S_NOP: u32 = 0xBF80_0000;
/// `s_endpgm`
const S_ENDPGM: u32 = 0xBF81_0000;

/// Compiler emitting empty programs
///
/// Each part is one `s_nop` per key input followed by `s_endpgm`, which is
/// enough for headless bring-up and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughCompiler;

impl ShaderCompiler for PassthroughCompiler {
    fn compile_vs_prolog(&self, key: &VsPrologKey) -> Option<ShaderBinary> {
        let mut code = vec![S_NOP; key.num_attributes as usize];
        code.push(S_ENDPGM);
        Some(ShaderBinary { code })
    }

    fn compile_ps_epilog(&self, key: &PsEpilogKey) -> Option<ShaderBinary> {
        let mut code = vec![S_NOP; key.colors_written.count_ones() as usize];
        code.push(S_ENDPGM);
        Some(ShaderBinary { code })
    }

    fn compile_trap_handler(&self) -> Option<ShaderBinary> {
        Some(ShaderBinary {
            code: vec![S_ENDPGM],
        })
    }
}

// =============================================================================
// CACHE
// =============================================================================

type Factory<K, V> = Box<dyn Fn(&K) -> Option<V> + Send + Sync>;

/// Keyed cache of reference-counted shader parts
pub struct ShaderPartCache<K, V> {
    entries: RwLock<HashMap<K, Arc<V>>>,
    factory: Factory<K, V>,
}

impl<K, V> ShaderPartCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Empty cache building misses with `factory`
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&K) -> Option<V> + Send + Sync + 'static,
    {
        Self {
            entries: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Cached part for `key`, building it on a miss
    ///
    /// Concurrent misses on one key may both build; the first insert wins and
    /// every caller gets that entry.
    pub fn get_or_create(&self, key: &K) -> Option<Arc<V>> {
        if let Some(part) = self.entries.read().get(key) {
            return Some(Arc::clone(part));
        }

        let built = Arc::new((self.factory)(key)?);
        let mut entries = self.entries.write();
        Some(Arc::clone(entries.entry(key.clone()).or_insert(built)))
    }

    /// Cached part for `key`, without building
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.read().get(key).cloned()
    }

    /// Number of cached parts
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Nothing cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached part; outstanding `Arc`s stay valid
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl<K, V> core::fmt::Debug for ShaderPartCache<K, V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShaderPartCache")
            .field("entries", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(ShaderPartCache<VsPrologKey, ShaderPart>: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_consecutive_masks() {
        assert_eq!(bit_consecutive(2, 3), 0b11100);
        assert_eq!(bit_consecutive(0, 32), u32::MAX);
        assert!(is_consecutive_mask(0b0111_0000));
        assert!(!is_consecutive_mask(0b0101));
        assert!(!is_consecutive_mask(0));
    }

    #[test]
    fn test_prolog_index_enumerates_every_slot_once() {
        let mut expected = 0;
        for num_attributes in 1..=MAX_PRECOMPILED_INSTANCE_RATE_ATTRIBS {
            for count in 1..=num_attributes {
                for start in 0..=(num_attributes - count) {
                    let mask = bit_consecutive(start, count);
                    assert_eq!(instance_rate_prolog_index(num_attributes, mask), expected);
                    expected += 1;
                }
            }
        }
        assert_eq!(expected, NUM_INSTANCE_RATE_PROLOGS);
    }

    #[test]
    fn test_cache_builds_once_and_shares() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let cache = ShaderPartCache::new(move |key: &VsPrologKey| {
            counter.fetch_add(1, Ordering::Relaxed);
            PassthroughCompiler
                .compile_vs_prolog(key)
                .map(|binary| ShaderPart::new(key, binary))
        });

        let key = VsPrologKey {
            num_attributes: 3,
            ..VsPrologKey::default()
        };
        let a = cache.get_or_create(&key).unwrap();
        let b = cache.get_or_create(&key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::Relaxed), 1);
        assert_eq!(a.binary.code.len(), 4);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let cache: ShaderPartCache<PsEpilogKey, ShaderPart> = ShaderPartCache::new(|_| None);
        assert!(cache.get_or_create(&PsEpilogKey::default()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_keeps_outstanding_parts() {
        let cache = ShaderPartCache::new(|key: &PsEpilogKey| {
            PassthroughCompiler
                .compile_ps_epilog(key)
                .map(|binary| ShaderPart::new(key, binary))
        });
        let part = cache.get_or_create(&PsEpilogKey::default()).unwrap();
        cache.clear();
        assert!(cache.get(&PsEpilogKey::default()).is_none());
        assert_eq!(part.binary.code, vec![S_ENDPGM]);
    }

    #[test]
    fn test_key_hash_distinguishes_keys() {
        let binary = ShaderBinary { code: vec![S_ENDPGM] };
        let a = ShaderPart::new(&VsPrologKey::default(), binary.clone());
        let b = ShaderPart::new(
            &VsPrologKey {
                wave32: 1,
                ..VsPrologKey::default()
            },
            binary,
        );
        assert_ne!(a.key_hash, b.key_hash);
    }
}
