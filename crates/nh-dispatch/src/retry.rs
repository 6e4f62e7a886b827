//! Retry policy
//!
//! Pure decision logic consumed by the worker pool: given the attempt count
//! after a failure and the priority's configuration, either route the item
//! to the dead-letter store or compute the backoff delay for the next
//! attempt.

use std::time::Duration;

use nh_common::PriorityConfig;

/// Dead-letter reason for items that exhausted their retry budget.
pub const MAX_ATTEMPTS_REASON: &str = "max attempts exceeded";

/// Dead-letter reason for non-retryable payloads.
pub const VALIDATION_REASON: &str = "validation failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry budget exhausted; the item goes to the dead-letter store.
    DeadLetter,
    /// Re-enqueue with `next_attempt_at = now + delay`.
    Retry { delay: Duration },
}

pub struct RetryPolicy;

impl RetryPolicy {
    /// Decide the fate of an item whose delivery just failed.
    /// `attempt_count` is the count *after* the failed attempt was recorded.
    pub fn decide(attempt_count: u32, config: &PriorityConfig) -> RetryDecision {
        if attempt_count >= config.max_attempts {
            return RetryDecision::DeadLetter;
        }
        RetryDecision::Retry {
            delay: Self::backoff_delay(attempt_count, config),
        }
    }

    /// Exponential backoff: `backoff_delay * 2^(attempt_count - 1)`, capped
    /// at `max_backoff_delay`.
    pub fn backoff_delay(attempt_count: u32, config: &PriorityConfig) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        let delay = config.backoff_delay.saturating_mul(1u32 << exponent);
        delay.min(config.max_backoff_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nh_common::PriorityMatrix;

    fn config() -> PriorityConfig {
        let mut config = PriorityMatrix::default().medium;
        config.max_attempts = 3;
        config.backoff_delay = Duration::from_millis(100);
        config.max_backoff_delay = Duration::from_millis(350);
        config
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = config();
        assert_eq!(
            RetryPolicy::backoff_delay(1, &config),
            Duration::from_millis(100)
        );
        assert_eq!(
            RetryPolicy::backoff_delay(2, &config),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn backoff_is_capped() {
        let config = config();
        assert_eq!(
            RetryPolicy::backoff_delay(3, &config),
            Duration::from_millis(350)
        );
        assert_eq!(
            RetryPolicy::backoff_delay(30, &config),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn dead_letter_exactly_at_max_attempts() {
        let config = config();
        assert!(matches!(
            RetryPolicy::decide(2, &config),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(RetryPolicy::decide(3, &config), RetryDecision::DeadLetter);
        assert_eq!(RetryPolicy::decide(4, &config), RetryDecision::DeadLetter);
    }
}
