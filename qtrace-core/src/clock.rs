//! Timestamp source
//!
//! Records carry a raw `tsc`: nanoseconds of `CLOCK_MONOTONIC`. The clock is
//! system-wide, so timestamps from independent processes are directly
//! comparable, which is what the tailer's cross-file merge relies on.
//!
//! Each trace file stores a `(monotonic, wall clock)` origin pair taken at
//! creation; [`ClockOrigin::to_local`] turns a tsc back into local time.

use chrono::{DateTime, Local, TimeZone, Utc};

/// Current monotonic time in nanoseconds
pub fn tsc() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is
    // always supported on Linux.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Monotonic/wall-clock pair recorded in a trace file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOrigin {
    /// Monotonic nanoseconds at creation
    pub mono_ns: u64,
    /// Nanoseconds since the Unix epoch at creation
    pub utc_ns: i64,
}

impl ClockOrigin {
    /// Sample both clocks now
    pub fn now() -> Self {
        let mono_ns = tsc();
        let utc_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        Self { mono_ns, utc_ns }
    }

    /// Convert a record timestamp to local wall-clock time
    pub fn to_local(&self, tsc: u64) -> DateTime<Local> {
        let delta = tsc as i128 - self.mono_ns as i128;
        let ns = (self.utc_ns as i128 + delta).clamp(0, i64::MAX as i128) as i64;
        Local.timestamp_nanos(ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsc_is_monotonic() {
        let a = tsc();
        let b = tsc();
        assert!(b >= a);
    }

    #[test]
    fn test_origin_round_trip() {
        let origin = ClockOrigin::now();
        let later = origin.to_local(origin.mono_ns + 1_500_000_000);
        let base = origin.to_local(origin.mono_ns);
        assert_eq!((later - base).num_milliseconds(), 1500);
    }
}
