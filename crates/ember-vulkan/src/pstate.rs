//! Power state control for profiling.
//!
//! Performance counters need stable clocks. The first holder of the profiling
//! lock raises the device to [`Pstate::Peak`]; the last one to release it
//! drops back to [`Pstate::None`].

use ember_winsys::Pstate;

use crate::device::Device;
use crate::result::{Result, VkError};

impl Device {
    /// Apply a power state through the first hardware context
    ///
    /// The power state is per device, so one context is enough. Chips
    /// without a stable power state accept every request.
    pub(crate) fn set_pstate(&self, enable: bool) -> bool {
        if !self.physical.info().has_stable_pstate {
            return true;
        }

        let pstate = if enable { Pstate::Peak } else { Pstate::None };
        match self.hw_ctx.iter().flatten().next() {
            Some(ctx) => match self.ws.ctx_set_pstate(ctx, pstate) {
                Ok(()) => true,
                Err(err) => {
                    log::warn!("failed to set pstate {pstate:?}: {err}");
                    false
                }
            },
            None => true,
        }
    }

    /// Take a reference on peak clocks
    pub fn acquire_profiling_lock(&self) -> Result<()> {
        let mut cnt = self.pstate_cnt.lock();
        if *cnt == 0 && !self.set_pstate(true) {
            return Err(VkError::Unknown);
        }
        *cnt += 1;
        Ok(())
    }

    /// Drop a reference taken by [`Device::acquire_profiling_lock`]
    pub fn release_profiling_lock(&self) {
        let mut cnt = self.pstate_cnt.lock();
        let Some(remaining) = cnt.checked_sub(1) else {
            log::warn!("profiling lock released without being held");
            return;
        };
        *cnt = remaining;
        if remaining == 0 && !self.set_pstate(false) {
            log::warn!("failed to restore the default pstate");
        }
    }

    /// Outstanding profiling lock references
    pub fn profiling_lock_count(&self) -> u32 {
        *self.pstate_cnt.lock()
    }
}
