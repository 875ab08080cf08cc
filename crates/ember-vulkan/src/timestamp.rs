//! Calibrated timestamps across the GPU and host clocks.

use ember_core::div_round_up;

use crate::device::Device;

/// Clock a calibrated timestamp is taken from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeDomain {
    /// GPU timestamp counter, in crystal clock ticks
    Device,
    /// `CLOCK_MONOTONIC`, in nanoseconds
    ClockMonotonic,
    /// `CLOCK_MONOTONIC_RAW`, in nanoseconds
    ClockMonotonicRaw,
    /// Windows performance counter; not available here
    QueryPerformanceCounter,
}

/// Timestamps sampled together, with the window they were taken in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalibratedTimestamps {
    /// One value per requested domain, 0 for unsupported domains
    pub timestamps: Vec<u64>,
    /// Upper bound on the skew between any two of the values, in ns
    pub max_deviation: u64,
}

/// Domains [`Device::calibrated_timestamps`] can sample
pub const CALIBRATEABLE_TIME_DOMAINS: [TimeDomain; 3] = [
    TimeDomain::Device,
    TimeDomain::ClockMonotonic,
    TimeDomain::ClockMonotonicRaw,
];

fn clock_gettime(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return 0;
    }
    let secs = u64::try_from(ts.tv_sec).unwrap_or(0);
    let nanos = u64::try_from(ts.tv_nsec).unwrap_or(0);
    secs.saturating_mul(1_000_000_000).saturating_add(nanos)
}

impl Device {
    /// Sample each domain as close together as possible
    ///
    /// The deviation is the length of the sampling window plus the coarsest
    /// clock period among the sampled domains.
    pub fn calibrated_timestamps(&self, domains: &[TimeDomain]) -> CalibratedTimestamps {
        let crystal_khz = u64::from(self.physical.info().clock_crystal_freq.max(1));
        let mut max_clock_period = 0u64;

        let begin = clock_gettime(libc::CLOCK_MONOTONIC_RAW);

        let timestamps = domains
            .iter()
            .map(|domain| match domain {
                TimeDomain::Device => {
                    let ts = self.ws.query_gpu_timestamp();
                    max_clock_period = max_clock_period.max(div_round_up(1_000_000, crystal_khz));
                    ts
                }
                TimeDomain::ClockMonotonic => {
                    max_clock_period = max_clock_period.max(1);
                    clock_gettime(libc::CLOCK_MONOTONIC)
                }
                TimeDomain::ClockMonotonicRaw => begin,
                TimeDomain::QueryPerformanceCounter => 0,
            })
            .collect();

        let end = clock_gettime(libc::CLOCK_MONOTONIC_RAW);

        CalibratedTimestamps {
            timestamps,
            max_deviation: end.saturating_sub(begin) + 1 + max_clock_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let a = clock_gettime(libc::CLOCK_MONOTONIC_RAW);
        let b = clock_gettime(libc::CLOCK_MONOTONIC_RAW);
        assert!(a > 0);
        assert!(b >= a);
    }
}
