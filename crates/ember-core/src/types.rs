//! # EMBER Core Types
//!
//! GPU virtual addresses, byte counts and typed backend handles.

use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, Sub};

// =============================================================================
// ALIGNMENT
// =============================================================================

/// Round `value` up to a power-of-two `alignment`
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Integer division rounding up
#[inline]
pub const fn div_round_up(value: u64, divisor: u64) -> u64 {
    value.div_ceil(divisor)
}

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// Address in a GPU virtual address space
///
/// Never dereferenced on the CPU. 0 means "no address".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Wrap a raw address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// The unassigned address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether the address is a multiple of the power-of-two `alignment`
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 % alignment == 0
    }

    /// Low dword, as split across `*_BASE` / `*_BASE_HI` register pairs
    #[inline]
    pub const fn lo(self) -> u32 {
        self.0 as u32
    }

    /// High dword
    #[inline]
    pub const fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

/// Distance in bytes
impl Sub for GpuAddr {
    type Output = u64;

    fn sub(self, base: Self) -> u64 {
        self.0.wrapping_sub(base.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr({:#x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// BYTE COUNTS
// =============================================================================

/// Byte count that prints in the largest whole binary unit
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Wrap a byte count
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Byte count
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(&str, u32); 3] = [("GiB", 30), ("MiB", 20), ("KiB", 10)];
        for (unit, shift) in UNITS {
            if self.0 >> shift != 0 {
                return write!(f, "{} {unit}", self.0 >> shift);
            }
        }
        write!(f, "{} B", self.0)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Typed id of a backend or API object
///
/// The marker keeps a BO handle from being passed where a context handle is
/// expected. Ids are never reused by a backend.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Wrap an id
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _kind: PhantomData,
        }
    }

    /// Raw id
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }
}

// Manual impls so the marker does not need the traits itself.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = core::any::type_name::<T>();
        let kind = kind.rsplit("::").next().unwrap_or(kind);
        write!(f, "{kind}#{}", self.id)
    }
}

/// Buffer objects
pub enum BoMarker {}
/// Hardware contexts
pub enum CtxMarker {}
/// API buffers
pub enum BufferMarker {}
/// API memory allocations
pub enum MemoryMarker {}

static_assertions::assert_eq_size!(GpuAddr, u64);
static_assertions::assert_impl_all!(Handle<BoMarker>: Send, Sync, Copy);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(17, 16), 32);
    }

    #[test]
    fn test_gpu_addr_split() {
        let addr = GpuAddr::new(0x0000_0012_3456_7800);
        assert_eq!(addr.hi(), 0x12);
        assert_eq!(addr.lo(), 0x3456_7800);
        assert_eq!((addr + 0x100).raw(), 0x0000_0012_3456_7900);
        assert_eq!(GpuAddr::new(0x3000) - GpuAddr::new(0x1000), 0x2000);
        assert!(addr.is_aligned(256));
        assert!(!addr.is_aligned(4096));
    }

    #[test]
    fn test_div_round_up() {
        assert_eq!(div_round_up(1_000_000, 100_000), 10);
        assert_eq!(div_round_up(1_000_000, 27_000), 38);
    }

    #[test]
    fn test_byte_size_units() {
        extern crate std;
        use std::format;
        assert_eq!(format!("{}", ByteSize::from_bytes(512)), "512 B");
        assert_eq!(format!("{}", ByteSize::from_bytes(64 << 10)), "64 KiB");
        assert_eq!(format!("{}", ByteSize::from_bytes(3 << 30)), "3 GiB");
    }

    #[test]
    fn test_handle_debug() {
        extern crate std;
        use std::format;
        assert_eq!(format!("{:?}", Handle::<BoMarker>::new(7)), "BoMarker#7");
    }
}
