use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Inner {
    failures: u32,
    last_failure: Option<Instant>,
}

/// The fast-fail circuit breaker guarding `connect()`.
///
/// State machine: `Closed` (failures < threshold) -> `Open` (failures >=
/// threshold) -> `Closed` (on any successful connect). No explicit
/// `HalfOpen` state is modeled; [`should_probe`](Self::should_probe) exposes
/// an optional bounded-probe allowance without introducing a third
/// externally observable state.
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Builds a new breaker with the given failure threshold and reset
    /// timeout.
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold,
            reset_timeout,
            inner: Mutex::new(Inner {
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Reports whether the breaker is currently open.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();

        inner.failures >= self.threshold
    }

    /// Reports the current failure count.
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Reports the timestamp of the last recorded failure, if any.
    pub fn last_failure(&self) -> Option<Instant> {
        self.inner.lock().last_failure
    }

    /// Records a connect failure, opening the breaker once the threshold is
    /// reached. This is called at most once per outer `connect()` call, not
    /// once per inner URL attempt.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();

        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
    }

    /// Resets the breaker to `Closed` with a zeroed failure count, called on
    /// any successful connect.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();

        inner.failures = 0;
        inner.last_failure = None;
    }

    /// Reports whether an open breaker is eligible for the optional bounded
    /// half-open probe: `reset_timeout` has elapsed since the last failure.
    /// Does not mutate state; the caller decides whether to actually spend
    /// the probe.
    pub fn should_probe(&self) -> bool {
        let inner = self.inner.lock();

        if inner.failures < self.threshold {
            return false;
        }

        match inner.last_failure {
            Some(last) => last.elapsed() >= self.reset_timeout,
            None => true,
        }
    }
}
