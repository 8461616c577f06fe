//! Wall-clock helpers.
//!
//! Pool timestamps (spawn times, last-used times, GC deadlines) are plain
//! microseconds since the Unix epoch, which keeps them trivially
//! comparable and serializable in snapshots.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall time in microseconds since the Unix epoch.
pub fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Round `usec` up to the next multiple of `step` microseconds.
///
/// Used to align periodic wakeups to second boundaries so that timers
/// across the host coalesce.
pub fn round_up_usec(usec: u64, step: u64) -> u64 {
    if step == 0 {
        return usec;
    }
    usec.div_ceil(step) * step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_nonzero_and_monotonic_enough() {
        let a = now_usec();
        let b = now_usec();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn round_up_aligns() {
        assert_eq!(round_up_usec(1_000_001, 1_000_000), 2_000_000);
        assert_eq!(round_up_usec(2_000_000, 1_000_000), 2_000_000);
        assert_eq!(round_up_usec(5, 0), 5);
    }
}
