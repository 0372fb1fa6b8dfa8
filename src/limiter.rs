//! Concurrency-limiting middleware.
//!
//! A fixed number of slots guards admission. Refusals bypass the breaker
//! policy entirely: an exhausted limiter says nothing about the health of
//! the wrapped dependency.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::circuit::State;
use crate::errors::{Canceled, ConfigError, Rejection};
use crate::observer::{Middleware, Observer, ObserverFactory};

/// Caps the number of concurrently admitted calls.
///
/// Non-blocking mode refuses immediately with
/// [`Rejection::ConcurrencyLimitReached`]; blocking mode waits for a free
/// slot and answers cancellation with [`Rejection::WaitingForSlot`].
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimiter {
    limit: usize,
    block: bool,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize, block: bool) -> Self {
        Self { limit, block }
    }
}

impl Middleware for ConcurrencyLimiter {
    fn wrap(&self, next: Arc<dyn ObserverFactory>) -> Result<Arc<dyn ObserverFactory>, ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::ZeroConcurrencyLimit);
        }
        Ok(Arc::new(LimitedFactory {
            slots: Arc::new(Semaphore::new(self.limit)),
            block: self.block,
            next,
        }))
    }
}

struct LimitedFactory {
    slots: Arc<Semaphore>,
    block: bool,
    next: Arc<dyn ObserverFactory>,
}

#[async_trait]
impl ObserverFactory for LimitedFactory {
    async fn observer_for_call(
        &self,
        ctx: &CancellationToken,
        state: State,
    ) -> Result<Box<dyn Observer>, Rejection> {
        let permit = if self.block {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    trace!("canceled while waiting for slot");
                    return Err(Rejection::WaitingForSlot(Canceled));
                }
                permit = Arc::clone(&self.slots).acquire_owned() => {
                    permit.expect("slot semaphore is never closed")
                }
            }
        } else {
            match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    trace!("concurrency limit reached");
                    return Err(Rejection::ConcurrencyLimitReached);
                }
            }
        };

        // If the inner factory refuses, dropping the permit frees the slot
        // right here and the refusal propagates unobserved.
        let inner = self.next.observer_for_call(ctx, state).await?;

        Ok(Box::new(SlotObserver {
            inner,
            permit: Mutex::new(Some(permit)),
        }))
    }
}

/// Holds a slot for the duration of one admitted call. The slot is freed at
/// observation; dropping the observer unobserved frees it as well.
struct SlotObserver {
    inner: Box<dyn Observer>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Observer for SlotObserver {
    fn observe(&self, failure: bool) {
        self.inner.observe(failure);
        drop(self.permit.lock().unwrap().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Circuit;
    use crate::errors::CircuitError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Wrapped function that parks on a gate until released.
    fn gated(
        gate: Arc<Notify>,
        started: Arc<AtomicUsize>,
    ) -> impl Fn(CancellationToken, ()) -> futures::future::BoxFuture<'static, Result<(), &'static str>>
    {
        use futures::FutureExt;
        move |_ctx, _in| {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok(())
            }
            .boxed()
        }
    }

    async fn wait_for(counter: &AtomicUsize, value: usize) {
        for _ in 0..500 {
            if counter.load(Ordering::SeqCst) >= value {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("wrapped function never started");
    }

    #[tokio::test]
    async fn non_blocking_rejects_at_capacity() {
        let gate = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));
        let circuit = Arc::new(
            Circuit::builder(gated(Arc::clone(&gate), Arc::clone(&started)))
                .middleware(ConcurrencyLimiter::new(1, false))
                .build()
                .unwrap(),
        );
        let ctx = CancellationToken::new();

        let held = {
            let circuit = Arc::clone(&circuit);
            let ctx = ctx.clone();
            tokio::spawn(async move { circuit.call(&ctx, ()).await })
        };
        wait_for(&started, 1).await;

        // The slot is taken; the next call is refused without running.
        assert_eq!(
            circuit.call(&ctx, ()).await,
            Err(CircuitError::Rejected(Rejection::ConcurrencyLimitReached))
        );
        assert_eq!(started.load(Ordering::SeqCst), 1);

        gate.notify_one();
        assert_eq!(held.await.unwrap(), Ok(()));

        // Slot is free again.
        gate.notify_one();
        assert_eq!(circuit.call(&ctx, ()).await, Ok(()));
    }

    #[tokio::test]
    async fn blocking_waits_until_a_slot_frees_up() {
        let gate = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));
        let circuit = Arc::new(
            Circuit::builder(gated(Arc::clone(&gate), Arc::clone(&started)))
                .middleware(ConcurrencyLimiter::new(1, true))
                .build()
                .unwrap(),
        );
        let ctx = CancellationToken::new();

        let first = {
            let circuit = Arc::clone(&circuit);
            let ctx = ctx.clone();
            tokio::spawn(async move { circuit.call(&ctx, ()).await })
        };
        wait_for(&started, 1).await;

        let second = {
            let circuit = Arc::clone(&circuit);
            let ctx = ctx.clone();
            tokio::spawn(async move { circuit.call(&ctx, ()).await })
        };

        // The second call is parked on the limiter, not on the gate.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok(()));

        wait_for(&started, 2).await;
        gate.notify_one();
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn blocking_cancellation_reports_waiting_for_slot() {
        let gate = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));
        let circuit = Arc::new(
            Circuit::builder(gated(Arc::clone(&gate), Arc::clone(&started)))
                .middleware(ConcurrencyLimiter::new(1, true))
                .build()
                .unwrap(),
        );

        let holder_ctx = CancellationToken::new();
        let held = {
            let circuit = Arc::clone(&circuit);
            let ctx = holder_ctx.clone();
            tokio::spawn(async move { circuit.call(&ctx, ()).await })
        };
        wait_for(&started, 1).await;

        let canceled_ctx = CancellationToken::new();
        canceled_ctx.cancel();
        assert_eq!(
            circuit.call(&canceled_ctx, ()).await,
            Err(CircuitError::Rejected(Rejection::WaitingForSlot(Canceled)))
        );

        // The in-flight call is unaffected and completes normally.
        gate.notify_one();
        assert_eq!(held.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn panic_frees_the_slot() {
        let circuit = Arc::new(
            Circuit::builder(|_ctx, explode: bool| async move {
                if explode {
                    panic!("kaboom");
                }
                Ok::<_, &str>(())
            })
            .middleware(ConcurrencyLimiter::new(1, false))
            .build()
            .unwrap(),
        );

        let task = {
            let circuit = Arc::clone(&circuit);
            tokio::spawn(async move { circuit.call(&CancellationToken::new(), true).await })
        };
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(circuit.call(&CancellationToken::new(), false).await, Ok(()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slots_are_conserved_under_load() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let circuit = {
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            Arc::new(
                Circuit::builder(move |_ctx, _in: ()| {
                    let in_flight = Arc::clone(&in_flight);
                    let max_in_flight = Arc::clone(&max_in_flight);
                    async move {
                        let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(current, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, &str>(())
                    }
                })
                .middleware(ConcurrencyLimiter::new(3, true))
                .build()
                .unwrap(),
            )
        };

        let ctx = CancellationToken::new();
        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let circuit = Arc::clone(&circuit);
                let ctx = ctx.clone();
                tokio::spawn(async move { circuit.call(&ctx, ()).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(()));
        }

        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
        let max = max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3, "limiter admitted {max} concurrent calls");
    }
}
