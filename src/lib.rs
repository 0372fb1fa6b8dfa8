//! Fusewire - generic async circuit breaker
//!
//! This crate wraps a fallible async operation in a circuit that opens when
//! the operation keeps failing, short-circuits calls while open, and probes
//! for recovery without hammering the dependency:
//! - Lock-free state machine (Closed → Open → HalfOpen) on a single atomic
//!   timestamp
//! - Two failure-detection policies: exponentially weighted moving average
//!   and a two-bucket sliding time window
//! - Exactly-once outcome observation per call, including cancellations
//!   noticed while the call still runs, and panics
//! - Composable admission middleware: concurrency limiting and call metrics
//!   ship in the box
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use fusewire::{Circuit, EwmaBreaker};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let circuit = Circuit::builder(|_ctx, name: String| async move {
//!     if name.is_empty() {
//!         Err("empty name")
//!     } else {
//!         Ok(format!("hello, {name}"))
//!     }
//! })
//! .breaker(EwmaBreaker::new(10, 0.1))
//! .half_open_delay(Duration::from_secs(1))
//! .build()?;
//!
//! let ctx = CancellationToken::new();
//! let greeting = circuit.call(&ctx, "world".to_string()).await;
//! assert!(greeting.is_ok());
//! # Ok(())
//! # }
//! ```
//!
//! Calls rejected while the circuit is open (or by a middleware) return a
//! [`Rejection`] and are never counted by the breaker policy; outcomes of
//! admitted calls are counted exactly once.

pub mod breaker;
pub mod builder;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod errors;
pub mod limiter;
pub mod metrics;
pub mod observer;

pub use breaker::{Breaker, EwmaBreaker, NoopBreaker, SlidingWindowBreaker, StateChange};
pub use builder::CircuitBuilder;
pub use circuit::{Circuit, State, WrappedFn};
pub use classifier::{ignore_cancellation, trip_on_all, CallFailure, FailureCondition};
pub use clock::{Clock, ManualClock, WallClock};
pub use errors::{Canceled, CircuitError, ConfigError, Rejection};
pub use limiter::ConcurrencyLimiter;
pub use metrics::CallMetrics;
pub use observer::{Middleware, MiddlewareFn, Observer, ObserverFactory};
