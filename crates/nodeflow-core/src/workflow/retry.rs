//! Retry policy for node execution.
//!
//! A node without a `retry` block runs once. With one, it runs up to
//! `max_attempts` times, waiting `delay_ms * backoff^(attempt - 1)` between
//! attempts.

use std::time::Duration;

use nodeflow_types::workflow::RetryConfig;

/// Upper bound on a single retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: f64,
}

impl RetryPolicy {
    /// Single attempt, no delay.
    pub const ONCE: RetryPolicy = RetryPolicy {
        max_attempts: 1,
        delay: Duration::ZERO,
        backoff: 1.0,
    };

    pub fn from_config(config: Option<&RetryConfig>) -> Self {
        match config {
            Some(c) => Self {
                max_attempts: c.max_attempts.max(1),
                delay: Duration::from_millis(c.delay_ms),
                backoff: if c.backoff.is_finite() && c.backoff > 0.0 { c.backoff } else { 1.0 },
            },
            None => Self::ONCE,
        }
    }

    /// Whether another attempt follows a failed `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.delay.as_secs_f64() * self.backoff.powi(exponent);
        if !secs.is_finite() || secs > MAX_RETRY_DELAY.as_secs_f64() {
            return MAX_RETRY_DELAY;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32, delay_ms: u64, backoff: f64) -> RetryConfig {
        RetryConfig {
            max_attempts,
            delay_ms,
            backoff,
        }
    }

    #[test]
    fn no_config_runs_once() {
        let policy = RetryPolicy::from_config(None);
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn retries_until_max_attempts() {
        let policy = RetryPolicy::from_config(Some(&config(3, 100, 2.0)));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn exponential_backoff() {
        let policy = RetryPolicy::from_config(Some(&config(4, 100, 2.0)));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::from_config(Some(&config(100, 60_000, 10.0)));
        assert_eq!(policy.delay_for(50), MAX_RETRY_DELAY);
    }

    #[test]
    fn invalid_backoff_treated_as_constant() {
        let policy = RetryPolicy::from_config(Some(&config(3, 50, -1.0)));
        assert_eq!(policy.delay_for(3), Duration::from_millis(50));
    }
}
