// Monotonic timestamps shared across processes
//
// CLOCK_MONOTONIC is system-wide, so a timestamp written into shared memory by
// the manager is comparable with one taken by a reader in another process.

use nix::time::{ClockId, clock_gettime};

/// Seconds on the system monotonic clock.
pub fn monotonic_seconds() -> f64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as f64 + ts.tv_nsec() as f64 * 1e-9,
        // CLOCK_MONOTONIC is always available on the supported platforms
        Err(_) => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_decreases() {
        let a = monotonic_seconds();
        let b = monotonic_seconds();
        assert!(a > 0.0);
        assert!(b >= a);
    }
}
