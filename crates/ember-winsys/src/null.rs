//! # Null Winsys
//!
//! In-process memory backend. BOs get real virtual addresses from an
//! [`AddressSpace`], CPU mappings are backed by host memory, and every call is
//! counted so callers can check that each create is matched by a destroy.
//!
//! Failures can be injected per call kind to drive error paths:
//!
//! ```text
//! ws.fail_nth(WinsysCall::BufferCreate, 3)   third create from now fails once
//! ws.fail_always(WinsysCall::BufferMap)      every map fails until cleared
//! ```

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use ember_core::{ByteSize, Error, GpuAddr, Handle, Result};
use hashbrown::HashMap;
use spin::Mutex;

use crate::address_space::{AddressSpace, VaRange};
use crate::{Bo, BoCreateInfo, BoDomain, BoFlags, BoHandle, BoPriority, CtxPriority, HwCtx, Pstate, Winsys};

// =============================================================================
// CALL ACCOUNTING
// =============================================================================

/// Backend calls that support failure injection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WinsysCall {
    /// `buffer_create`
    BufferCreate,
    /// `buffer_virtual_bind`
    BufferVirtualBind,
    /// `buffer_make_resident`
    BufferMakeResident,
    /// `buffer_map`
    BufferMap,
    /// `buffer_get_fd`
    BufferGetFd,
    /// `buffer_from_fd`
    BufferFromFd,
    /// `ctx_create`
    CtxCreate,
    /// `ctx_set_pstate`
    CtxSetPstate,
}

/// Per-call counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    /// `buffer_create` calls, successful or not
    pub buffer_create: u64,
    /// `buffer_destroy` calls
    pub buffer_destroy: u64,
    /// `buffer_virtual_bind` calls
    pub virtual_bind: u64,
    /// `buffer_make_resident` calls
    pub make_resident: u64,
    /// `buffer_map` calls
    pub map: u64,
    /// `buffer_unmap` calls
    pub unmap: u64,
    /// `buffer_get_fd` calls
    pub get_fd: u64,
    /// `buffer_from_fd` calls
    pub from_fd: u64,
    /// `ctx_create` calls
    pub ctx_create: u64,
    /// `ctx_destroy` calls
    pub ctx_destroy: u64,
    /// `ctx_set_pstate` calls
    pub set_pstate: u64,
}

/// One `buffer_virtual_bind` request as received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualBindRecord {
    /// Virtual BO being modified
    pub parent: BoHandle,
    /// Byte offset into the virtual BO
    pub offset: u64,
    /// Byte size of the range
    pub size: u64,
    /// Backing BO, `None` for unbind
    pub bo: Option<BoHandle>,
    /// Byte offset into the backing BO
    pub bo_offset: u64,
}

#[derive(Debug)]
struct Fault {
    call: WinsysCall,
    countdown: u64,
    persistent: bool,
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug)]
struct BoRecord {
    range: VaRange,
    low_4g: bool,
    size: u64,
    domain: BoDomain,
    flags: BoFlags,
    resident: bool,
    storage: Option<Box<[u8]>>,
}

#[derive(Debug, Clone, Copy)]
struct ExportedFd {
    size: u64,
    domain: BoDomain,
    flags: BoFlags,
}

struct State {
    va: AddressSpace,
    va_32bit: AddressSpace,
    bos: HashMap<u64, BoRecord>,
    ctxs: HashMap<u64, CtxPriority>,
    fds: HashMap<i32, ExportedFd>,
    next_fd: i32,
    max_ctx_priority: CtxPriority,
    stats: CallStats,
    pstates: Vec<Pstate>,
    virtual_binds: Vec<VirtualBindRecord>,
    faults: Vec<Fault>,
}

impl State {
    fn should_fail(&mut self, call: WinsysCall) -> bool {
        let Some(pos) = self.faults.iter().position(|f| f.call == call) else {
            return false;
        };
        let fault = &mut self.faults[pos];
        if fault.persistent {
            return true;
        }
        fault.countdown -= 1;
        if fault.countdown == 0 {
            self.faults.remove(pos);
            true
        } else {
            false
        }
    }

    fn space(&mut self, low_4g: bool) -> &mut AddressSpace {
        if low_4g { &mut self.va_32bit } else { &mut self.va }
    }
}

// =============================================================================
// NULL WINSYS
// =============================================================================

/// In-process [`Winsys`] with call accounting and failure injection
pub struct NullWinsys {
    state: Mutex<State>,
    next_id: AtomicU64,
    epoch: Instant,
    crystal_khz: u32,
}

/// Start of the general-purpose VA range
const VA_BASE: u64 = 1 << 32;
/// Size of the general-purpose VA range (128 TiB)
const VA_SIZE: u64 = 1 << 47;
/// Start of the 32-bit VA range
const VA_32BIT_BASE: u64 = 0x1_0000;

impl NullWinsys {
    /// Backend with a 100 MHz timestamp crystal
    pub fn new() -> Self {
        Self::with_crystal_freq(100_000)
    }

    /// Backend whose timestamps tick at `crystal_khz`
    pub fn with_crystal_freq(crystal_khz: u32) -> Self {
        Self {
            state: Mutex::new(State {
                va: AddressSpace::new(VaRange::new(GpuAddr::new(VA_BASE), VA_SIZE)),
                va_32bit: AddressSpace::new(VaRange::new(
                    GpuAddr::new(VA_32BIT_BASE),
                    VA_BASE - VA_32BIT_BASE,
                )),
                bos: HashMap::new(),
                ctxs: HashMap::new(),
                fds: HashMap::new(),
                next_fd: 100,
                max_ctx_priority: CtxPriority::Realtime,
                stats: CallStats::default(),
                pstates: Vec::new(),
                virtual_binds: Vec::new(),
                faults: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
            crystal_khz,
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Make the `n`-th (1-based) next call of `call` fail once
    pub fn fail_nth(&self, call: WinsysCall, n: u64) {
        assert!(n > 0, "fail_nth is 1-based");
        self.state.lock().faults.push(Fault {
            call,
            countdown: n,
            persistent: false,
        });
    }

    /// Make every call of `call` fail
    pub fn fail_always(&self, call: WinsysCall) {
        self.state.lock().faults.push(Fault {
            call,
            countdown: 1,
            persistent: true,
        });
    }

    /// Remove all injected failures
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Contexts above `priority` are rejected, as for an unprivileged process
    pub fn set_max_ctx_priority(&self, priority: CtxPriority) {
        self.state.lock().max_ctx_priority = priority;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Call counters so far
    pub fn stats(&self) -> CallStats {
        self.state.lock().stats.clone()
    }

    /// BOs created and not yet destroyed
    pub fn live_bo_count(&self) -> usize {
        self.state.lock().bos.len()
    }

    /// Contexts created and not yet destroyed
    pub fn live_ctx_count(&self) -> usize {
        self.state.lock().ctxs.len()
    }

    /// BOs currently on the resident list
    pub fn resident_bo_count(&self) -> usize {
        self.state.lock().bos.values().filter(|b| b.resident).count()
    }

    /// Free virtual address space across both ranges
    pub fn free_va_space(&self) -> ByteSize {
        let state = self.state.lock();
        ByteSize::from_bytes(
            state.va.free_space().as_bytes() + state.va_32bit.free_space().as_bytes(),
        )
    }

    /// Every power state requested, in order
    pub fn pstate_log(&self) -> Vec<Pstate> {
        self.state.lock().pstates.clone()
    }

    /// Every virtual bind received, in order
    pub fn virtual_bind_log(&self) -> Vec<VirtualBindRecord> {
        self.state.lock().virtual_binds.clone()
    }

    /// Copy of the CPU-visible contents of a live, previously mapped BO
    pub fn bo_contents(&self, handle: BoHandle) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state
            .bos
            .get(&handle.id())
            .and_then(|b| b.storage.as_ref())
            .map(|s| s.to_vec())
    }

    /// Placement of a live BO
    pub fn bo_placement(&self, handle: BoHandle) -> Option<(u64, BoDomain, BoFlags)> {
        let state = self.state.lock();
        state
            .bos
            .get(&handle.id())
            .map(|b| (b.size, b.domain, b.flags))
    }
}

impl Default for NullWinsys {
    fn default() -> Self {
        Self::new()
    }
}

impl Winsys for NullWinsys {
    fn buffer_create(&self, info: &BoCreateInfo) -> Result<Bo> {
        let mut state = self.state.lock();
        state.stats.buffer_create += 1;
        if state.should_fail(WinsysCall::BufferCreate) {
            return Err(Error::OutOfVram);
        }
        if info.size == 0 {
            return Err(Error::InvalidParameter);
        }

        let low_4g = info.flags.contains(BoFlags::ADDR_32BIT);
        let space = state.space(low_4g);
        let range = if info.address != 0 {
            space.allocate_at(GpuAddr::new(info.address), info.size)?
        } else {
            space.allocate(info.size, info.alignment)?
        };

        let id = self.alloc_id();
        state.bos.insert(id, BoRecord {
            range,
            low_4g,
            size: info.size,
            domain: info.domain,
            flags: info.flags,
            resident: false,
            storage: None,
        });
        log::trace!("null winsys: bo {id} at {} size {}", range.start, info.size);

        Ok(Bo::new(Handle::new(id), range.start, info.size, info.domain, info.flags))
    }

    fn buffer_destroy(&self, bo: Bo) {
        let mut state = self.state.lock();
        state.stats.buffer_destroy += 1;
        let Some(record) = state.bos.remove(&bo.handle().id()) else {
            log::warn!("null winsys: destroying unknown bo {:?}", bo.handle());
            return;
        };
        if state.space(record.low_4g).free(record.range).is_err() {
            log::warn!("null winsys: bo {:?} had no VA range", bo.handle());
        }
    }

    fn buffer_virtual_bind(
        &self,
        parent: &Bo,
        offset: u64,
        size: u64,
        bo: Option<&Bo>,
        bo_offset: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.virtual_bind += 1;
        if state.should_fail(WinsysCall::BufferVirtualBind) {
            return Err(Error::OutOfMemory);
        }

        let record = state.bos.get(&parent.handle().id()).ok_or(Error::InvalidHandle)?;
        if !record.flags.contains(BoFlags::VIRTUAL) {
            return Err(Error::InvalidParameter);
        }
        if offset.checked_add(size).is_none_or(|end| end > record.size) {
            return Err(Error::InvalidParameter);
        }
        if let Some(child) = bo {
            let child_record = state.bos.get(&child.handle().id()).ok_or(Error::InvalidHandle)?;
            if bo_offset.checked_add(size).is_none_or(|end| end > child_record.size) {
                return Err(Error::InvalidParameter);
            }
        }

        state.virtual_binds.push(VirtualBindRecord {
            parent: parent.handle(),
            offset,
            size,
            bo: bo.map(Bo::handle),
            bo_offset,
        });
        Ok(())
    }

    fn buffer_make_resident(&self, bo: &Bo, resident: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.make_resident += 1;
        if state.should_fail(WinsysCall::BufferMakeResident) {
            return Err(Error::OutOfMemory);
        }
        let record = state.bos.get_mut(&bo.handle().id()).ok_or(Error::InvalidHandle)?;
        record.resident = resident;
        Ok(())
    }

    fn buffer_map(&self, bo: &Bo) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        state.stats.map += 1;
        if state.should_fail(WinsysCall::BufferMap) {
            return None;
        }
        let record = state.bos.get_mut(&bo.handle().id())?;
        if record.flags.intersects(BoFlags::VIRTUAL | BoFlags::NO_CPU_ACCESS) {
            return None;
        }
        let size = usize::try_from(record.size).ok()?;
        let storage = record
            .storage
            .get_or_insert_with(|| vec![0u8; size].into_boxed_slice());
        NonNull::new(storage.as_mut_ptr())
    }

    fn buffer_unmap(&self, _bo: &Bo) {
        self.state.lock().stats.unmap += 1;
    }

    fn buffer_get_fd(&self, bo: &Bo) -> Result<i32> {
        let mut state = self.state.lock();
        state.stats.get_fd += 1;
        if state.should_fail(WinsysCall::BufferGetFd) {
            return Err(Error::OutOfMemory);
        }
        let record = state.bos.get(&bo.handle().id()).ok_or(Error::InvalidHandle)?;
        if record.flags.contains(BoFlags::NO_INTERPROCESS_SHARING) {
            return Err(Error::NotSupported);
        }
        let export = ExportedFd {
            size: record.size,
            domain: record.domain,
            flags: record.flags,
        };
        let fd = state.next_fd;
        state.next_fd += 1;
        state.fds.insert(fd, export);
        Ok(fd)
    }

    fn buffer_get_flags_from_fd(&self, fd: i32) -> Option<(BoDomain, BoFlags)> {
        self.state.lock().fds.get(&fd).map(|e| (e.domain, e.flags))
    }

    fn buffer_from_fd(&self, fd: i32, _priority: BoPriority) -> Result<Bo> {
        let mut state = self.state.lock();
        state.stats.from_fd += 1;
        if state.should_fail(WinsysCall::BufferFromFd) {
            return Err(Error::InvalidFd);
        }
        let export = *state.fds.get(&fd).ok_or(Error::InvalidFd)?;
        let range = state.va.allocate(export.size, 4096)?;

        let id = self.alloc_id();
        state.bos.insert(id, BoRecord {
            range,
            low_4g: false,
            size: export.size,
            domain: export.domain,
            flags: export.flags,
            resident: false,
            storage: None,
        });
        Ok(Bo::new(Handle::new(id), range.start, export.size, export.domain, export.flags))
    }

    fn ctx_create(&self, priority: CtxPriority) -> Result<HwCtx> {
        let mut state = self.state.lock();
        state.stats.ctx_create += 1;
        if state.should_fail(WinsysCall::CtxCreate) || priority > state.max_ctx_priority {
            return Err(Error::ContextCreationFailed);
        }
        let id = self.alloc_id();
        state.ctxs.insert(id, priority);
        Ok(HwCtx::new(Handle::new(id), priority))
    }

    fn ctx_destroy(&self, ctx: HwCtx) {
        let mut state = self.state.lock();
        state.stats.ctx_destroy += 1;
        if state.ctxs.remove(&ctx.handle().id()).is_none() {
            log::warn!("null winsys: destroying unknown context {:?}", ctx.handle());
        }
    }

    fn ctx_set_pstate(&self, ctx: &HwCtx, pstate: Pstate) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.set_pstate += 1;
        if state.should_fail(WinsysCall::CtxSetPstate) {
            return Err(Error::PstateRejected);
        }
        if !state.ctxs.contains_key(&ctx.handle().id()) {
            return Err(Error::InvalidHandle);
        }
        state.pstates.push(pstate);
        Ok(())
    }

    fn query_gpu_timestamp(&self) -> u64 {
        let nanos = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        nanos.saturating_mul(u64::from(self.crystal_khz)) / 1_000_000
    }
}

static_assertions::assert_impl_all!(NullWinsys: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn gtt(size: u64) -> BoCreateInfo {
        BoCreateInfo::new(size, 4096, BoDomain::GTT, BoFlags::CPU_ACCESS)
    }

    #[test]
    fn test_create_destroy_restores_va() {
        let ws = NullWinsys::new();
        let before = ws.free_va_space();
        let bo = ws.buffer_create(&gtt(10_000)).unwrap();
        assert!(ws.free_va_space() < before);
        ws.buffer_destroy(bo);
        assert_eq!(ws.free_va_space(), before);
        assert_eq!(ws.live_bo_count(), 0);
    }

    #[test]
    fn test_32bit_addresses() {
        let ws = NullWinsys::new();
        let info = BoCreateInfo::new(4096, 4096, BoDomain::VRAM, BoFlags::ADDR_32BIT);
        let bo = ws.buffer_create(&info).unwrap();
        assert!(bo.va().raw() + bo.size() <= 1 << 32);
        ws.buffer_destroy(bo);
    }

    #[test]
    fn test_fail_nth() {
        let ws = NullWinsys::new();
        ws.fail_nth(WinsysCall::BufferCreate, 2);
        let a = ws.buffer_create(&gtt(4096)).unwrap();
        assert_eq!(ws.buffer_create(&gtt(4096)).unwrap_err(), Error::OutOfVram);
        let b = ws.buffer_create(&gtt(4096)).unwrap();
        ws.buffer_destroy(a);
        ws.buffer_destroy(b);
        assert_eq!(ws.stats().buffer_create, 3);
    }

    #[test]
    fn test_map_is_zeroed_and_persistent() {
        let ws = NullWinsys::new();
        let bo = ws.buffer_create(&gtt(16)).unwrap();
        let ptr = ws.buffer_map(&bo).unwrap();
        unsafe { ptr.as_ptr().write(0xab) };
        ws.buffer_unmap(&bo);
        assert_eq!(ws.bo_contents(bo.handle()).unwrap()[0], 0xab);
        ws.buffer_destroy(bo);
    }

    #[test]
    fn test_virtual_bind_requires_virtual_parent() {
        let ws = NullWinsys::new();
        let plain = ws.buffer_create(&gtt(8192)).unwrap();
        assert_eq!(
            ws.buffer_virtual_bind(&plain, 0, 4096, None, 0),
            Err(Error::InvalidParameter)
        );
        ws.buffer_destroy(plain);
    }

    #[test]
    fn test_fd_round_trip_keeps_placement() {
        let ws = NullWinsys::new();
        let bo = ws.buffer_create(&gtt(4096)).unwrap();
        let fd = ws.buffer_get_fd(&bo).unwrap();
        assert_eq!(
            ws.buffer_get_flags_from_fd(fd),
            Some((BoDomain::GTT, BoFlags::CPU_ACCESS))
        );
        assert_eq!(ws.buffer_get_flags_from_fd(fd + 1), None);
        let imported = ws.buffer_from_fd(fd, BoPriority::APPLICATION).unwrap();
        assert_eq!(imported.size(), 4096);
        ws.buffer_destroy(imported);
        ws.buffer_destroy(bo);
    }

    #[test]
    fn test_realtime_context_denied() {
        let ws = NullWinsys::new();
        ws.set_max_ctx_priority(CtxPriority::High);
        assert!(ws.ctx_create(CtxPriority::Realtime).is_err());
        let ctx = ws.ctx_create(CtxPriority::High).unwrap();
        ws.ctx_destroy(ctx);
        assert_eq!(ws.live_ctx_count(), 0);
    }
}
