//! Circuit state machine and the per-call observation pipeline.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::breaker::{Breaker, StateChange};
use crate::builder::CircuitBuilder;
use crate::classifier::{CallFailure, FailureCondition};
use crate::clock::{duration_micros, Clock};
use crate::errors::{CircuitError, Rejection};
use crate::observer::{Observer, ObserverFactory, OnceObserver};

/// Externally visible state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through to the wrapped operation.
    Closed,
    /// A limited (~1) number of probe calls is admitted.
    HalfOpen,
    /// Calls are short-circuited with [`Rejection::CircuitOpen`].
    Open,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Closed => f.write_str("closed"),
            State::HalfOpen => f.write_str("half-open"),
            State::Open => f.write_str("open"),
        }
    }
}

/// Type-erased wrapped operation.
pub type WrappedFn<In, Out, E> =
    Box<dyn Fn(CancellationToken, In) -> BoxFuture<'static, Result<Out, E>> + Send + Sync>;

/// Policy-facing part of a circuit: the atomic open timestamp, the breaker
/// and the clock. Separate from [`Circuit`] so observers and middlewares
/// need no knowledge of the wrapped operation's types.
pub(crate) struct CircuitCore {
    breaker: Box<dyn Breaker>,
    half_open_delay: Duration,
    clock: Arc<dyn Clock>,
    /// Clock microseconds; zero while the circuit is closed.
    opened_at: AtomicI64,
}

impl CircuitCore {
    pub(crate) fn new(
        breaker: Box<dyn Breaker>,
        half_open_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breaker,
            half_open_delay,
            clock,
            opened_at: AtomicI64::new(0),
        }
    }

    pub(crate) fn state(&self) -> State {
        let opened_at = self.opened_at.load(Ordering::Acquire);
        if opened_at == 0 {
            return State::Closed;
        }
        // A zero delay pins an opened circuit open until the breaker closes
        // it through some other feedback.
        if self.half_open_delay.is_zero() {
            return State::Open;
        }
        if self.clock.now_micros() - opened_at < duration_micros(self.half_open_delay) {
            State::Open
        } else {
            State::HalfOpen
        }
    }

    /// State used to admit the next call.
    ///
    /// A half-open reading re-stamps the open timestamp so concurrent
    /// callers keep seeing an open circuit until this probe resolves.
    /// Slightly racy: a few callers may slip through half-open together.
    pub(crate) fn state_for_call(&self) -> State {
        let state = self.state();
        if state == State::HalfOpen {
            self.opened_at
                .store(self.clock.now_micros(), Ordering::Release);
            debug!(state = %State::HalfOpen, "admitting probe call");
        }
        state
    }

    fn open(&self) {
        // CAS from zero keeps the first opener's timestamp when several
        // observers open the circuit at once.
        if self
            .opened_at
            .compare_exchange(0, self.clock.now_micros(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(state = %State::Open, "circuit opened");
        }
    }

    fn close(&self) {
        if self.opened_at.swap(0, Ordering::AcqRel) != 0 {
            debug!(state = %State::Closed, "circuit closed");
        }
    }

    pub(crate) fn apply(&self, change: StateChange) {
        match change {
            StateChange::None => {}
            StateChange::Open => self.open(),
            StateChange::Close => self.close(),
        }
    }

    #[cfg(test)]
    fn opened_at_micros(&self) -> i64 {
        self.opened_at.load(Ordering::Acquire)
    }
}

/// The innermost observer factory: refuses calls while open and routes every
/// observation into the breaker, applying its verdict to the circuit.
pub(crate) struct CoreFactory {
    pub(crate) core: Arc<CircuitCore>,
}

#[async_trait]
impl ObserverFactory for CoreFactory {
    async fn observer_for_call(
        &self,
        _ctx: &CancellationToken,
        state: State,
    ) -> Result<Box<dyn Observer>, Rejection> {
        if state == State::Open {
            return Err(Rejection::CircuitOpen);
        }
        Ok(Box::new(StateObserver {
            core: Arc::clone(&self.core),
            half_open: state == State::HalfOpen,
        }))
    }
}

struct StateObserver {
    core: Arc<CircuitCore>,
    half_open: bool,
}

impl Observer for StateObserver {
    fn observe(&self, failure: bool) {
        let change = self.core.breaker.observe(self.half_open, failure);
        self.core.apply(change);
    }
}

/// Wraps a fallible async operation and short-circuits calls while the
/// breaker considers the dependency broken.
///
/// Circuits are cheap to call when closed (a state read, an observer
/// allocation and one policy update) and are meant to be shared: all methods
/// take `&self`, so wrap the circuit in an [`Arc`] and call it from as many
/// tasks as needed.
///
/// Construct with [`Circuit::builder`]; calls must run inside a tokio
/// runtime, since observing cancellation uses a background task.
pub struct Circuit<In, Out, E> {
    f: WrappedFn<In, Out, E>,
    core: Arc<CircuitCore>,
    is_failure: FailureCondition<E>,
    observer_factory: Arc<dyn ObserverFactory>,
}

impl<In, Out, E> fmt::Debug for Circuit<In, Out, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit").finish_non_exhaustive()
    }
}

impl<In, Out, E> Circuit<In, Out, E>
where
    In: Send + 'static,
    Out: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Starts building a circuit around `f`.
    ///
    /// `f` receives a clone of the caller's cancellation token; honoring it
    /// is optional, the circuit reacts to cancellation either way.
    pub fn builder<F, Fut>(f: F) -> CircuitBuilder<In, Out, E>
    where
        F: Fn(CancellationToken, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, E>> + Send + 'static,
    {
        CircuitBuilder::new(Box::new(move |ctx, input| f(ctx, input).boxed()))
    }

    pub(crate) fn from_parts(
        f: WrappedFn<In, Out, E>,
        core: Arc<CircuitCore>,
        is_failure: FailureCondition<E>,
        observer_factory: Arc<dyn ObserverFactory>,
    ) -> Self {
        Self {
            f,
            core,
            is_failure,
            observer_factory,
        }
    }

    /// Current state of the circuit.
    ///
    /// Informational only and racy by design; prefer calling the circuit
    /// over checking its state first.
    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Calls the wrapped operation if the circuit admits it.
    ///
    /// Admission refusals ([`Rejection`]) are returned without running the
    /// operation and without feeding the breaker. Admitted calls are
    /// observed exactly once: as the operation's outcome, as a cancellation
    /// noticed while it still runs, or as a panic. Cancellation is observed
    /// as soon as it happens, so the circuit can open quickly even while the
    /// operation keeps blocking; the operation's eventual result is still
    /// returned to the caller verbatim.
    ///
    /// Panics are observed as failures and resumed, never swallowed.
    pub async fn call(&self, ctx: &CancellationToken, input: In) -> Result<Out, CircuitError<E>> {
        let state = self.core.state_for_call();
        let observer = self
            .observer_factory
            .observer_for_call(ctx, state)
            .await
            .map_err(CircuitError::Rejected)?;

        let observer = Arc::new(OnceObserver::new(observer));

        // The flag distinguishes "the operation returned and we are tearing
        // the watcher down" from a caller-side cancellation.
        let finished = Arc::new(AtomicBool::new(false));
        let watch = ctx.child_token();
        drop(tokio::spawn(watch_cancellation(
            watch.clone(),
            Arc::clone(&finished),
            Arc::clone(&observer),
            Arc::clone(&self.is_failure),
        )));
        // Tears the watcher down on every exit path, including panics and a
        // dropped call future (which the watcher then reports as canceled).
        let _watch_guard = watch.drop_guard();

        let result = AssertUnwindSafe((self.f)(ctx.clone(), input))
            .catch_unwind()
            .await;

        finished.store(true, Ordering::Release);

        match result {
            Err(panic) => {
                observer.observe(true);
                std::panic::resume_unwind(panic);
            }
            Ok(Ok(out)) => {
                observer.observe(false);
                Ok(out)
            }
            Ok(Err(err)) => {
                observer.observe((self.is_failure)(&CallFailure::Error(&err)));
                Err(CircuitError::Operation(err))
            }
        }
    }
}

/// Reports a cancellation of a still-running call through the shared
/// observer. The one-shot observer resolves the race against the call's own
/// observation.
async fn watch_cancellation<E: 'static>(
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    observer: Arc<OnceObserver>,
    is_failure: FailureCondition<E>,
) {
    token.cancelled().await;
    if finished.load(Ordering::Acquire) {
        return;
    }
    observer.observe(is_failure(&CallFailure::Canceled));
}
