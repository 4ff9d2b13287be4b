use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Computes the reconnect backoff delay for a given attempt number, per the
/// formula: `base` when `exponential` is disabled, otherwise
/// `clamp(base * 2^attempt + jitter, base, cap)` where `jitter` is uniform in
/// `±20%` of the exponential term.
///
/// This intentionally does not reuse the `backoff` crate's
/// [`ExponentialBackoff`](https://docs.rs/backoff) algorithm: that crate's
/// jitter and growth semantics differ from the exact clamp wanted here —
/// delay stays within `[reconnect_delay, 60_000 ms]` and is non-decreasing
/// until the cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    exponential: bool,
}

impl BackoffPolicy {
    /// Creates a new policy with the given base delay, hard cap, and whether
    /// exponential growth is enabled.
    pub fn new(base: Duration, cap: Duration, exponential: bool) -> Self {
        Self {
            base,
            cap,
            exponential,
        }
    }

    /// Computes the delay for the given zero-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base;
        }

        let base_millis = self.base.as_millis() as f64;
        let exponential_term = base_millis * 2f64.powi(attempt as i32);

        let jitter_span = exponential_term * 0.2;
        let jitter = rand::rng().random_range(-jitter_span..=jitter_span);

        let raw_millis = (exponential_term + jitter).max(0.0);
        let clamped_millis = raw_millis
            .max(self.base.as_millis() as f64)
            .min(self.cap.as_millis() as f64);

        Duration::from_millis(clamped_millis as u64)
    }
}

/// Tracks a running reconnect-attempt counter alongside a [`BackoffPolicy`],
/// pairing the algorithm with interior-mutable state and exposing the exact
/// attempt count (needed to detect `max_reconnect_attempts` exhaustion)
/// rather than hiding it.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: AtomicU32,
}

impl Backoff {
    /// Builds a new [`Backoff`] tracker around the given policy.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: AtomicU32::new(0),
        }
    }

    /// Returns the delay for the current attempt, then advances the attempt
    /// counter.
    pub fn next(&self) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::Relaxed);

        self.policy.delay_for(attempt)
    }

    /// Sleeps for the delay computed by [`next`](Self::next).
    pub async fn sleep_next(&self) {
        let duration = self.next();

        tokio::time::sleep(duration).await;
    }

    /// Resets the attempt counter back to zero.
    pub fn reset(&self) {
        self.attempt.store(0, Ordering::Relaxed);
    }

    /// Reports how many attempts have been consumed since the last
    /// [`reset`](Self::reset).
    pub fn attempts(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }
}
