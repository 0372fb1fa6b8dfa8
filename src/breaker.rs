//! Failure-detection policies deciding when a circuit opens or closes.
//!
//! A policy sees one outcome per admitted call and answers with a
//! [`StateChange`] verdict; the circuit applies the verdict to its atomic
//! state. Policies are lock-free and shared by all calls of one circuit, but
//! must not be shared between circuits: each instance carries mutable state.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{duration_micros, Clock, WallClock};
use crate::errors::ConfigError;

/// Verdict returned by a breaker after observing one call outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// Leave the circuit as it is.
    None,
    /// Open the circuit.
    Open,
    /// Close the circuit.
    Close,
}

/// A failure-detection policy.
pub trait Breaker: Send + Sync {
    /// Updates the failure tracking with one observed outcome and returns
    /// the resulting verdict. `half_open` reports whether the call was
    /// admitted as a half-open probe.
    fn observe(&self, half_open: bool, failure: bool) -> StateChange;

    /// Hands the breaker the circuit clock during construction.
    fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        let _ = clock;
    }

    /// Validates and adjusts the circuit's half-open delay.
    ///
    /// Runs after all other options have been applied, so the breaker sees
    /// the combined configuration.
    fn configure(&mut self, half_open_delay: &mut Duration) -> Result<(), ConfigError> {
        let _ = half_open_delay;
        Ok(())
    }
}

/// Policy used when none is configured: the circuit never opens.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBreaker;

impl Breaker for NoopBreaker {
    fn observe(&self, _half_open: bool, _failure: bool) -> StateChange {
        StateChange::None
    }
}

/// Bit pattern marking a failure rate that has not observed any call yet.
///
/// The smallest positive subnormal is never produced by the blend below, so
/// a genuine rate of 0.0 stays distinguishable from "never observed".
const NEVER_OBSERVED: u64 = 1;

/// Exponentially weighted moving average of failure outcomes, counting each
/// failure as 1.0 and each success as 0.0.
///
/// Compared to [`SlidingWindowBreaker`] this responds faster to sudden
/// failure bursts but is more lenient with constant low failure rates. It
/// assumes calls arrive at a roughly constant interval and will skew results
/// otherwise.
///
/// This is an observation-based policy: an open circuit can only close again
/// by observing a successful probe, so it requires the circuit to configure
/// a non-zero half-open delay.
#[derive(Debug)]
pub struct EwmaBreaker {
    decay: f64,
    threshold: f64,
    /// f64 bits; see [`NEVER_OBSERVED`].
    failure_rate: AtomicU64,
}

impl EwmaBreaker {
    /// `sample_count` controls how fast old observations decay: 1 means only
    /// the latest sample counts, higher values slow convergence. Policies on
    /// high-throughput circuits should use higher sample counts to ride out
    /// small hiccups.
    ///
    /// `threshold` is the failure rate above which the circuit opens
    /// (0.0..=1.0); zero disables the policy entirely.
    pub fn new(sample_count: u32, threshold: f64) -> Self {
        // Classic exponential smoothing constant, capped at 1 so the blended
        // rate cannot leave [0, 1] for sample counts below 2.
        let decay = (2.0 / (f64::from(sample_count) / 2.0 + 1.0)).min(1.0);
        Self {
            decay,
            threshold,
            failure_rate: AtomicU64::new(NEVER_OBSERVED),
        }
    }

    /// Current failure rate estimate, if any call has been observed yet.
    pub fn failure_rate(&self) -> Option<f64> {
        match self.failure_rate.load(Ordering::Acquire) {
            NEVER_OBSERVED => None,
            bits => Some(f64::from_bits(bits)),
        }
    }
}

impl Breaker for EwmaBreaker {
    fn observe(&self, half_open: bool, failure: bool) -> StateChange {
        if self.threshold == 0.0 {
            return StateChange::None;
        }

        if !failure && half_open {
            // Re-seed at the threshold: the very next observation can push
            // the circuit either way.
            self.failure_rate
                .store(self.threshold.to_bits(), Ordering::Release);
            return StateChange::Close;
        }

        let value: f64 = if failure { 1.0 } else { 0.0 };

        // Swap-then-blend is not linearizable: two racing observers may blend
        // against the same previous value and one update wins. Accepted, the
        // estimate is statistical anyway.
        let previous = self.failure_rate.swap(value.to_bits(), Ordering::AcqRel);
        let rate = if previous == NEVER_OBSERVED {
            value
        } else {
            let rate = value * self.decay + f64::from_bits(previous) * (1.0 - self.decay);
            self.failure_rate.store(rate.to_bits(), Ordering::Release);
            rate
        };

        if rate > self.threshold {
            StateChange::Open
        } else {
            StateChange::Close
        }
    }

    fn configure(&mut self, half_open_delay: &mut Duration) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.threshold));
        }
        // Without half-open probes an open circuit would never observe a
        // success again and stay open forever.
        if half_open_delay.is_zero() {
            return Err(ConfigError::MissingHalfOpenDelay);
        }
        Ok(())
    }
}

/// Failure rate over a trailing time window, tracked in two rolling buckets.
///
/// The previous bucket is weighted by how much of it still lies inside the
/// trailing window, so old outcomes fade out linearly. A window with no
/// observations reads as a zero failure rate, which means a stale circuit
/// re-closes on its own once the window has passed.
#[derive(Debug)]
pub struct SlidingWindowBreaker {
    window_size: Duration,
    threshold: f64,
    clock: Arc<dyn Clock>,

    /// Start of the current bucket in clock microseconds.
    current_start: AtomicI64,
    current_success: AtomicI64,
    current_failure: AtomicI64,
    last_success: AtomicI64,
    last_failure: AtomicI64,
}

impl SlidingWindowBreaker {
    /// `window_size` is the interval the failure rate is calculated over;
    /// `threshold` is the rate above which the circuit opens (0.0..=1.0).
    ///
    /// If the circuit's half-open delay is unset or larger than the window,
    /// it is coerced to the window size: past one silent window the rate is
    /// zero anyway, so a longer delay would never be exercised.
    pub fn new(window_size: Duration, threshold: f64) -> Self {
        Self {
            window_size,
            threshold,
            clock: Arc::new(WallClock),
            current_start: AtomicI64::new(0),
            current_success: AtomicI64::new(0),
            current_failure: AtomicI64::new(0),
            last_success: AtomicI64::new(0),
            last_failure: AtomicI64::new(0),
        }
    }
}

impl Breaker for SlidingWindowBreaker {
    fn observe(&self, half_open: bool, failure: bool) -> StateChange {
        if !failure && half_open {
            return StateChange::Close;
        }

        let window = duration_micros(self.window_size);
        let now = self.clock.now_micros();
        let started = self.current_start.load(Ordering::Acquire);
        let mut elapsed = now - started;

        // A single CAS winner rotates the buckets; losers read whatever is
        // there mid-rotation, losing at most one count per boundary.
        let (last_failure, last_success) = if elapsed > window
            && self
                .current_start
                .compare_exchange(started, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            elapsed = 0;
            (
                self.last_failure
                    .swap(self.current_failure.swap(0, Ordering::AcqRel), Ordering::AcqRel),
                self.last_success
                    .swap(self.current_success.swap(0, Ordering::AcqRel), Ordering::AcqRel),
            )
        } else {
            (
                self.last_failure.load(Ordering::Acquire),
                self.last_success.load(Ordering::Acquire),
            )
        };

        let (current_failure, current_success) = if failure {
            (
                self.current_failure.fetch_add(1, Ordering::AcqRel) + 1,
                self.current_success.load(Ordering::Acquire),
            )
        } else {
            (
                self.current_failure.load(Ordering::Acquire),
                self.current_success.fetch_add(1, Ordering::AcqRel) + 1,
            )
        };

        // Share of the previous bucket still visible in the trailing window.
        let weight = (window - elapsed).clamp(0, window) as f64 / window as f64;

        let weighted_failures = last_failure as f64 * weight + current_failure as f64;
        let weighted_total =
            (last_failure + last_success) as f64 * weight + (current_failure + current_success) as f64;
        let rate = weighted_failures / weighted_total;

        if rate > self.threshold {
            StateChange::Open
        } else {
            StateChange::Close
        }
    }

    fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    fn configure(&mut self, half_open_delay: &mut Duration) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.threshold));
        }
        if self.window_size.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        if half_open_delay.is_zero() || *half_open_delay > self.window_size {
            *half_open_delay = self.window_size;
        }
        Ok(())
    }
}
