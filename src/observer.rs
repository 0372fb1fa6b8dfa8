//! Per-call observation protocol and middleware composition.
//!
//! Every admitted call gets exactly one [`Observer`] from the circuit's
//! [`ObserverFactory`] pipeline, and that observer records exactly one
//! outcome. [`Middleware`]s wrap the factory to add cross-cutting behavior
//! (concurrency limiting, metrics) around admission and observation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::circuit::State;
use crate::errors::{ConfigError, Rejection};

/// Records the outcome of a single admitted call.
pub trait Observer: Send + Sync {
    /// Reports whether the call failed.
    ///
    /// Invoked at most once per call; the circuit enforces this with a
    /// one-shot wrapper around the composed observer, so implementations do
    /// not need their own deduplication.
    fn observe(&self, failure: bool);
}

/// Produces an [`Observer`] for each incoming call, or refuses admission.
#[async_trait]
pub trait ObserverFactory: Send + Sync {
    /// Called exactly once per call, before the wrapped operation runs.
    ///
    /// `state` is the circuit state the call is being admitted under. An
    /// `Err` refuses the call; refused calls are returned to the caller
    /// unchanged and never reach the breaker policy.
    async fn observer_for_call(
        &self,
        ctx: &CancellationToken,
        state: State,
    ) -> Result<Box<dyn Observer>, Rejection>;
}

/// Transforms an [`ObserverFactory`], adding behavior around admission and
/// observation.
///
/// Middlewares are applied while the circuit is built, so configuration
/// problems surface from [`CircuitBuilder::build`](crate::CircuitBuilder::build)
/// rather than from call sites.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Arc<dyn ObserverFactory>) -> Result<Arc<dyn ObserverFactory>, ConfigError>;
}

/// Adapter turning a plain function into a [`Middleware`].
pub struct MiddlewareFn<F>(pub F);

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(Arc<dyn ObserverFactory>) -> Result<Arc<dyn ObserverFactory>, ConfigError>
        + Send
        + Sync,
{
    fn wrap(&self, next: Arc<dyn ObserverFactory>) -> Result<Arc<dyn ObserverFactory>, ConfigError> {
        (self.0)(next)
    }
}

/// One-shot wrapper: only the first observation reaches the inner observer.
pub(crate) struct OnceObserver {
    inner: Box<dyn Observer>,
    seen: AtomicBool,
}

impl OnceObserver {
    pub(crate) fn new(inner: Box<dyn Observer>) -> Self {
        Self {
            inner,
            seen: AtomicBool::new(false),
        }
    }
}

impl Observer for OnceObserver {
    fn observe(&self, failure: bool) {
        if !self.seen.swap(true, Ordering::AcqRel) {
            self.inner.observe(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingObserver {
        observations: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
    }

    impl Observer for CountingObserver {
        fn observe(&self, failure: bool) {
            self.observations.fetch_add(1, Ordering::SeqCst);
            if failure {
                self.failures.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn once_observer_forwards_only_the_first_outcome() {
        let observations = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let observer = OnceObserver::new(Box::new(CountingObserver {
            observations: Arc::clone(&observations),
            failures: Arc::clone(&failures),
        }));

        observer.observe(true);
        observer.observe(false);
        observer.observe(true);

        assert_eq!(observations.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_observer_dedups_across_threads() {
        let observations = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let observer = Arc::new(OnceObserver::new(Box::new(CountingObserver {
            observations: Arc::clone(&observations),
            failures: Arc::clone(&failures),
        })));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let observer = Arc::clone(&observer);
                std::thread::spawn(move || observer.observe(i % 2 == 0))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(observations.load(Ordering::SeqCst), 1);
    }
}
