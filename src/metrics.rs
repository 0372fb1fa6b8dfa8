//! Call-metrics middleware reporting through the `metrics` facade.
//!
//! The middleware is purely observational: it never refuses calls on its own
//! and never influences the breaker. Place it outside a concurrency limiter
//! to count the limiter's refusals, or inside to ignore them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use tokio_util::sync::CancellationToken;

use crate::circuit::State;
use crate::clock::{Clock, WallClock};
use crate::errors::{ConfigError, Rejection};
use crate::observer::{Middleware, Observer, ObserverFactory};

/// Counter of calls refused by the admission pipeline, labelled by `circuit`
/// and `cause`.
pub const DROPPED_CALLS: &str = "circuit_dropped_calls_total";
/// Gauge of calls between admission and observation, labelled by `circuit`.
pub const INFLIGHT_CALLS: &str = "circuit_inflight_calls";
/// Histogram of call durations in seconds, labelled by `circuit` and
/// `success`.
pub const CALL_DURATION: &str = "circuit_call_duration_seconds";

/// Middleware recording per-call metrics for one circuit.
///
/// The `circuit` label must be unique per circuit sharing a metrics
/// recorder.
pub struct CallMetrics {
    circuit: String,
    clock: Arc<dyn Clock>,
}

impl CallMetrics {
    pub fn new(circuit: impl Into<String>) -> Self {
        Self {
            circuit: circuit.into(),
            clock: Arc::new(WallClock),
        }
    }

    /// Replaces the duration clock, mainly for tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Middleware for CallMetrics {
    fn wrap(&self, next: Arc<dyn ObserverFactory>) -> Result<Arc<dyn ObserverFactory>, ConfigError> {
        Ok(Arc::new(MetricsFactory {
            circuit: self.circuit.clone(),
            clock: Arc::clone(&self.clock),
            next,
        }))
    }
}

struct MetricsFactory {
    circuit: String,
    clock: Arc<dyn Clock>,
    next: Arc<dyn ObserverFactory>,
}

fn cause(rejection: &Rejection) -> &'static str {
    match rejection {
        Rejection::CircuitOpen => "circuit_open",
        Rejection::ConcurrencyLimitReached => "concurrency_limit",
        Rejection::WaitingForSlot(_) => "waiting_for_slot",
    }
}

#[async_trait]
impl ObserverFactory for MetricsFactory {
    async fn observer_for_call(
        &self,
        ctx: &CancellationToken,
        state: State,
    ) -> Result<Box<dyn Observer>, Rejection> {
        let inner = match self.next.observer_for_call(ctx, state).await {
            Ok(observer) => observer,
            Err(rejection) => {
                counter!(
                    DROPPED_CALLS,
                    "circuit" => self.circuit.clone(),
                    "cause" => cause(&rejection)
                )
                .increment(1);
                return Err(rejection);
            }
        };

        gauge!(INFLIGHT_CALLS, "circuit" => self.circuit.clone()).increment(1.0);

        Ok(Box::new(MetricsObserver {
            circuit: self.circuit.clone(),
            clock: Arc::clone(&self.clock),
            started_micros: self.clock.now_micros(),
            inner,
        }))
    }
}

struct MetricsObserver {
    circuit: String,
    clock: Arc<dyn Clock>,
    started_micros: i64,
    inner: Box<dyn Observer>,
}

impl Observer for MetricsObserver {
    fn observe(&self, failure: bool) {
        let elapsed =
            Duration::from_micros((self.clock.now_micros() - self.started_micros).max(0) as u64);
        // Inverted to `success` so dashboards read naturally.
        let success = if failure { "false" } else { "true" };
        histogram!(
            CALL_DURATION,
            "circuit" => self.circuit.clone(),
            "success" => success
        )
        .record(elapsed.as_secs_f64());
        gauge!(INFLIGHT_CALLS, "circuit" => self.circuit.clone()).decrement(1.0);
        self.inner.observe(failure);
    }
}
