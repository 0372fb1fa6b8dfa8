//! Error types for admission, construction and call outcomes.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// A call was canceled through its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("call canceled")]
pub struct Canceled;

/// Reasons the admission pipeline can refuse a call before the wrapped
/// operation runs.
///
/// Refused calls are returned to the caller as-is and never reach the
/// breaker policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The circuit is open and short-circuiting calls.
    #[error("circuit is open")]
    CircuitOpen,
    /// A non-blocking concurrency limiter had no free slot.
    #[error("concurrency limit reached")]
    ConcurrencyLimitReached,
    /// A blocking concurrency limiter was canceled while waiting for a slot.
    #[error("waiting for slot")]
    WaitingForSlot(#[source] Canceled),
}

/// Configuration problems surfaced by [`CircuitBuilder::build`](crate::CircuitBuilder::build).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("failure threshold must be within 0.0..=1.0, got {0}")]
    ThresholdOutOfRange(f64),
    #[error("breaker requires a non-zero half-open delay")]
    MissingHalfOpenDelay,
    #[error("sliding window size must be non-zero")]
    ZeroWindow,
    #[error("concurrency limit must be greater than zero")]
    ZeroConcurrencyLimit,
}

/// Error returned by [`Circuit::call`](crate::Circuit::call).
#[derive(Debug, PartialEq)]
pub enum CircuitError<E> {
    /// The call was refused before the wrapped operation ran.
    Rejected(Rejection),
    /// The wrapped operation ran and failed; its error is passed through
    /// verbatim.
    Operation(E),
}

impl<E> CircuitError<E> {
    /// True if the call was short-circuited by an open circuit.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Rejected(Rejection::CircuitOpen))
    }
}

impl<E> From<Rejection> for CircuitError<E> {
    fn from(rejection: Rejection) -> Self {
        Self::Rejected(rejection)
    }
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Rejected(rejection) => rejection.fmt(f),
            CircuitError::Operation(err) => err.fmt(f),
        }
    }
}

impl<E: StdError + 'static> StdError for CircuitError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            CircuitError::Rejected(rejection) => Some(rejection),
            CircuitError::Operation(err) => Some(err),
        }
    }
}
