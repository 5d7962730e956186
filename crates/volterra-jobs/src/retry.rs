//! Retry policies for failed jobs and enqueue attempts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// No retry.
    None,
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff with optional jitter.
    Exponential,
}

/// Retry policy carried by every envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0); zero disables jitter.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    /// Creates a policy with no retries.
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates a fixed delay retry policy.
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_retries,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff retry policy.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_retries,
            initial_delay_ms: 1000,
            max_delay_ms: 600_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Returns true if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.strategy != RetryStrategy::None && attempt <= self.max_retries
    }

    /// Delay before the retry that follows attempt number `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = match self.strategy {
            RetryStrategy::None => return Duration::ZERO,
            RetryStrategy::Fixed => self.initial_delay_ms,
            RetryStrategy::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                (self.initial_delay_ms as f64 * self.multiplier.powi(exp)) as u64
            }
        };
        let capped = base.min(self.max_delay_ms);

        if self.jitter_factor <= 0.0 {
            return Duration::from_millis(capped);
        }

        let range = (capped as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jittered = capped
            .saturating_add(random_below(range))
            .saturating_sub(range / 2);
        Duration::from_millis(jittered)
    }

    /// Wall-clock time of the retry that follows attempt number `attempt`.
    pub fn retry_at(&self, attempt: u32) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::from_std(self.delay_for_attempt(attempt)).unwrap_or_default()
    }
}

fn random_below(range: u64) -> u64 {
    if range == 0 {
        return 0;
    }
    (uuid::Uuid::new_v4().as_u128() % u128::from(range)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::none();
        assert!(!policy.should_retry(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_fixed_retry() {
        let policy = RetryPolicy::fixed(2, 250);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(3).without_jitter();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential(20)
            .with_max_delay(Duration::from_secs(10))
            .without_jitter();
        assert_eq!(policy.delay_for_attempt(15), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::exponential(3);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1).as_millis();
            assert!((950..=1050).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn test_retry_at_is_in_future() {
        let policy = RetryPolicy::fixed(1, 5_000);
        assert!(policy.retry_at(1) > Utc::now());
    }
}
