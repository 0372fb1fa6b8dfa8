//! Fluent construction and validation of circuits.

use std::sync::Arc;
use std::time::Duration;

use crate::breaker::{Breaker, NoopBreaker};
use crate::circuit::{Circuit, CircuitCore, CoreFactory, WrappedFn};
use crate::classifier::{trip_on_all, CallFailure, FailureCondition};
use crate::clock::{Clock, WallClock};
use crate::errors::ConfigError;
use crate::observer::{Middleware, ObserverFactory};

/// Builder returned by [`Circuit::builder`].
///
/// Options apply in call order; the breaker is consulted last so it can veto
/// or adjust the combined configuration.
pub struct CircuitBuilder<In, Out, E> {
    f: WrappedFn<In, Out, E>,
    breaker: Box<dyn Breaker>,
    half_open_delay: Duration,
    is_failure: FailureCondition<E>,
    clock: Arc<dyn Clock>,
    middlewares: Vec<Box<dyn Middleware>>,
}

impl<In, Out, E> CircuitBuilder<In, Out, E>
where
    In: Send + 'static,
    Out: Send + 'static,
    E: Send + Sync + 'static,
{
    pub(crate) fn new(f: WrappedFn<In, Out, E>) -> Self {
        Self {
            f,
            breaker: Box::new(NoopBreaker),
            half_open_delay: Duration::ZERO,
            is_failure: Arc::new(trip_on_all),
            clock: Arc::new(WallClock),
            middlewares: Vec::new(),
        }
    }

    /// Sets the failure-detection policy. Without one the circuit never
    /// opens and is a plain pass-through around the wrapped operation.
    pub fn breaker(mut self, breaker: impl Breaker + 'static) -> Self {
        self.breaker = Box::new(breaker);
        self
    }

    /// Minimum time the circuit stays open before a probe call is admitted.
    ///
    /// Zero (the default) means an opened circuit never recovers on its own.
    pub fn half_open_delay(mut self, delay: Duration) -> Self {
        self.half_open_delay = delay;
        self
    }

    /// Custom condition deciding which unsuccessful outcomes count as
    /// failures. Defaults to [`trip_on_all`].
    pub fn failure_condition<C>(mut self, condition: C) -> Self
    where
        C: Fn(&CallFailure<'_, E>) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(condition);
        self
    }

    /// Replaces the wall clock, mainly for tests and simulations.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Adds a middleware around the admission pipeline.
    ///
    /// The first middleware added sits closest to the circuit; later ones
    /// wrap around it. Ordering matters: metrics outside a limiter see the
    /// limiter's refusals, metrics inside it do not.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Box::new(middleware));
        self
    }

    /// Validates the configuration and assembles the circuit.
    pub fn build(self) -> Result<Circuit<In, Out, E>, ConfigError> {
        let mut breaker = self.breaker;
        let mut half_open_delay = self.half_open_delay;

        breaker.set_clock(Arc::clone(&self.clock));
        breaker.configure(&mut half_open_delay)?;

        let core = Arc::new(CircuitCore::new(breaker, half_open_delay, self.clock));

        let mut factory: Arc<dyn ObserverFactory> = Arc::new(CoreFactory {
            core: Arc::clone(&core),
        });
        for middleware in &self.middlewares {
            factory = middleware.wrap(factory)?;
        }

        Ok(Circuit::from_parts(self.f, core, self.is_failure, factory))
    }
}
