use std::time::Duration;

use crate::config::{
    RETRY_BACKOFF_MULTIPLIER, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS, RETRY_MAX_RETRIES,
};
use crate::fetch::transport::TransportError;

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = fn(&TransportError) -> bool;

/// Exponential backoff configuration. Read-only while a call executes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub retry_predicate: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: RETRY_MAX_RETRIES,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
            backoff_multiplier: RETRY_BACKOFF_MULTIPLIER,
            retry_predicate: TransportError::is_retryable,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after failed attempt `attempt` (1-indexed):
    /// `min(base_delay * multiplier^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let raw = base_ms * self.backoff_multiplier.powi(exponent);
        // powi overflows to inf for large exponents; min() folds that into the cap.
        let ms = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(ms.max(0.0) as u64)
    }

    pub fn should_retry(&self, err: &TransportError) -> bool {
        (self.retry_predicate)(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_delays_double_then_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=6)
            .map(|n| policy.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn huge_attempt_numbers_stay_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(5_000), Duration::from_millis(10_000));
    }

    #[test]
    fn default_predicate_classifies_errors() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&TransportError::Timeout));
        assert!(policy.should_retry(&TransportError::Network("reset".into())));
        assert!(policy.should_retry(&TransportError::Status { status: 503, body: String::new() }));
        assert!(!policy.should_retry(&TransportError::Status { status: 404, body: String::new() }));
        assert!(!policy.should_retry(&TransportError::Status { status: 429, body: String::new() }));
        assert!(!policy.should_retry(&TransportError::Decode("eof".into())));
    }

    #[test]
    fn attempts_include_first_try() {
        assert_eq!(RetryPolicy::default().max_attempts(), 4);
        assert_eq!(RetryPolicy::no_retry().max_attempts(), 1);
    }
}
