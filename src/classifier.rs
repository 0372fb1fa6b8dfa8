//! Failure classification: which call outcomes count against the breaker.

use std::sync::Arc;

/// An unsuccessful call outcome, as handed to a [`FailureCondition`].
///
/// Successful calls never consult the condition; it only decides whether an
/// already-unsuccessful outcome should count towards opening the circuit.
#[derive(Debug)]
pub enum CallFailure<'a, E> {
    /// The wrapped operation returned an error.
    Error(&'a E),
    /// The caller's cancellation token fired while the operation was still
    /// running.
    Canceled,
}

/// Decides whether an unsuccessful outcome may open the circuit.
pub type FailureCondition<E> = Arc<dyn Fn(&CallFailure<'_, E>) -> bool + Send + Sync>;

/// Default condition: every error and every observed cancellation counts.
pub fn trip_on_all<E>(_failure: &CallFailure<'_, E>) -> bool {
    true
}

/// Ignores cancellations; any other error still counts.
pub fn ignore_cancellation<E>(failure: &CallFailure<'_, E>) -> bool {
    !matches!(failure, CallFailure::Canceled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_condition_trips_on_everything() {
        assert!(trip_on_all(&CallFailure::Error(&"boom")));
        assert!(trip_on_all::<&str>(&CallFailure::Canceled));
    }

    #[test]
    fn ignore_cancellation_only_skips_cancellations() {
        assert!(ignore_cancellation(&CallFailure::Error(&"boom")));
        assert!(!ignore_cancellation::<&str>(&CallFailure::Canceled));
    }
}
