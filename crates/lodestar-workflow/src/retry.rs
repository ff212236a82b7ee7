//! Retry backoff policy with exponential delay and jitter.

use crate::config::RetryConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

/// Exponential backoff policy for failed tasks.
///
/// The delay for retry attempt `n` (zero-based) is
/// `min(max_interval_ms, initial_interval_ms * multiplier^n * jitter)`
/// where `jitter` is uniform in `[1.0, 1.25)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First retry delay in milliseconds.
    pub initial_interval_ms: u64,

    /// Multiplier applied per attempt (typically 2.0 for doubling).
    pub multiplier: f64,

    /// Delay ceiling in milliseconds.
    pub max_interval_ms: u64,

    /// Default retry budget.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            multiplier: 2.0,
            max_interval_ms: 60_000,
            max_attempts: 3,
        }
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_interval_ms: config.initial_interval,
            multiplier: config.multiplier,
            max_interval_ms: config.max_interval,
            max_attempts: config.max_attempts,
        }
    }
}

impl BackoffPolicy {
    /// Creates a new backoff policy.
    pub fn new(initial_interval_ms: u64, multiplier: f64, max_interval_ms: u64) -> Self {
        Self {
            initial_interval_ms,
            multiplier,
            max_interval_ms,
            max_attempts: 3,
        }
    }

    /// Sets the default retry budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Calculates the delay for a retry attempt with a fresh jitter factor.
    pub fn next_delay_ms(&self, attempt: u32) -> u64 {
        self.delay_with_jitter(attempt, jitter_factor())
    }

    /// Calculates the delay for a retry attempt as a [`std::time::Duration`].
    pub fn next_delay(&self, attempt: u32) -> StdDuration {
        StdDuration::from_millis(self.next_delay_ms(attempt))
    }

    /// Calculates the wall-clock instant of the next retry.
    pub fn next_retry_at(&self, attempt: u32) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.next_delay_ms(attempt) as i64)
    }

    /// Delay computation with an explicit jitter factor.
    ///
    /// The cap applies after jitter, so the returned delay never exceeds
    /// `max_interval_ms`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> u64 {
        let raw = self.initial_interval_ms as f64 * self.multiplier.powi(attempt as i32) * jitter;
        (raw as u64).min(self.max_interval_ms)
    }
}

/// Uniform jitter factor in `[1.0, 1.25)`.
fn jitter_factor() -> f64 {
    1.0 + rand::random::<f64>() * 0.25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_without_jitter() {
        let policy = BackoffPolicy::new(1_000, 2.0, 60_000);

        assert_eq!(policy.delay_with_jitter(0, 1.0), 1_000);
        assert_eq!(policy.delay_with_jitter(1, 1.0), 2_000);
        assert_eq!(policy.delay_with_jitter(2, 1.0), 4_000);
        assert_eq!(policy.delay_with_jitter(3, 1.0), 8_000);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::new(1_000, 2.0, 10_000);

        assert_eq!(policy.delay_with_jitter(10, 1.0), 10_000);
        // Cap applies after jitter as well
        assert_eq!(policy.delay_with_jitter(10, 1.24), 10_000);
    }

    #[test]
    fn test_delays_non_decreasing() {
        let policy = BackoffPolicy::default();
        let mut previous = 0;
        for attempt in 0..12 {
            let delay = policy.delay_with_jitter(attempt, 1.0);
            assert!(delay >= previous);
            assert!(delay <= policy.max_interval_ms);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BackoffPolicy::new(1_000, 2.0, 600_000);
        for _ in 0..200 {
            let delay = policy.next_delay_ms(2);
            assert!(delay >= 4_000);
            assert!(delay < 5_000);
        }
    }

    #[test]
    fn test_next_retry_at_is_in_the_future() {
        let policy = BackoffPolicy::default();
        let at = policy.next_retry_at(0);
        assert!(at > Utc::now());
    }

    #[test]
    fn test_from_retry_config() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_interval: 250,
            multiplier: 3.0,
            max_interval: 20_000,
        };
        let policy = BackoffPolicy::from(&config);
        assert_eq!(policy.initial_interval_ms, 250);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_with_jitter(1, 1.0), 750);
    }
}
