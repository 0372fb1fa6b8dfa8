//! Time sources for circuit state and failure windows.
//!
//! All circuit bookkeeping runs on microsecond timestamps from a [`Clock`],
//! so tests and simulations can drive state transitions without sleeping.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microsecond-resolution time source.
///
/// Implementations must be cheap to query and safe to share between threads.
/// A reading of zero is reserved: circuits use it as the "closed" marker, so
/// clocks must never report zero after construction.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in microseconds since the clock's epoch.
    fn now_micros(&self) -> i64;
}

/// System clock, microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as i64)
            .unwrap_or(1)
    }
}

/// Manually advanced clock for tests and simulations.
///
/// Starts one second after its epoch so fresh timestamps stay distinguishable
/// from the zeroed "closed" marker.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            micros: AtomicI64::new(1_000_000),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(duration_micros(by), Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.micros.load(Ordering::Acquire)
    }
}

pub(crate) fn duration_micros(duration: Duration) -> i64 {
    duration.as_micros().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_is_nonzero_and_advances() {
        let clock = WallClock;
        let first = clock.now_micros();
        assert!(first > 0);

        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now_micros() > first);
    }

    #[test]
    fn manual_clock_advances_by_exact_amounts() {
        let clock = ManualClock::new();
        let start = clock.now_micros();
        assert!(start > 0);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_micros(), start + 250_000);

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now_micros(), start + 1_250_000);
    }

    #[test]
    fn duration_micros_saturates() {
        assert_eq!(duration_micros(Duration::MAX), i64::MAX);
        assert_eq!(duration_micros(Duration::from_micros(42)), 42);
    }
}
