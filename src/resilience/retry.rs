//! Retry delay policy.
//!
//! `delay = min(max, base * 2^attempt + jitter)` where jitter is uniform in
//! `[0, base)`. Network failures wait 1.5x longer and rate-limit responses 3x
//! longer, applied before the cap.

use std::time::Duration;

use rand::Rng;

use crate::error::FetchError;

const NETWORK_MULTIPLIER: f64 = 1.5;
const RATE_LIMIT_MULTIPLIER: f64 = 3.0;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (default: 3).
    pub max_retries: u32,
    /// Delay unit for backoff and jitter (default: 1s).
    pub base_delay: Duration,
    /// Upper bound for any delay (default: 30s).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based) with random jitter.
    pub fn delay_for(&self, attempt: u32, error: Option<&FetchError>) -> Duration {
        let jitter = rand::rng().random::<f64>();
        self.delay_with_jitter(attempt, error, jitter)
    }

    /// Deterministic variant of [`delay_for`](Self::delay_for).
    ///
    /// `jitter` is the fraction of `base_delay` added, clamped to `[0, 1)`.
    pub fn delay_with_jitter(&self, attempt: u32, error: Option<&FetchError>, jitter: f64) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let jitter = jitter.clamp(0.0, 1.0 - f64::EPSILON);
        let exponential = base * 2f64.powi(attempt.min(62) as i32);
        let mut delay = exponential + jitter * base;

        match error {
            Some(e) if e.is_rate_limited() => delay *= RATE_LIMIT_MULTIPLIER,
            Some(e) if e.is_network() => delay *= NETWORK_MULTIPLIER,
            _ => {}
        }

        let max = self.max_delay.as_secs_f64();
        Duration::from_secs_f64(delay.min(max))
    }
}
