//! Retry decisions and backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after the delay; this is attempt number `attempt` (1-based).
    RetryAfter { attempt: u32, delay: Duration },
    /// Retries exhausted: the request ends in ERROR.
    GiveUp,
}

/// Decides whether a failed request runs again and when.
///
/// `retry_count` is the number of retries already made; `max_retries` and
/// `base_delay` come from the live configuration.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }

    /// Delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32, base_delay: Duration) -> Duration;

    fn decide(&self, retry_count: u32, max_retries: u32, base_delay: Duration) -> RetryDecision {
        if !self.should_retry(retry_count, max_retries) {
            return RetryDecision::GiveUp;
        }
        let attempt = retry_count.saturating_add(1);
        RetryDecision::RetryAfter {
            attempt,
            delay: self.backoff(attempt, base_delay),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    #[default]
    Fixed,
    /// base * attempt
    Linear,
    /// base * 2^(attempt - 1)
    Exponential,
}

/// Strategy-driven retry policy. The default is a fixed delay without jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffRetryPolicy {
    pub strategy: BackoffStrategy,
    /// Upper bound for the computed delay (before jitter)
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0); deterministic per attempt
    pub jitter: f64,
}

impl Default for BackoffRetryPolicy {
    fn default() -> Self {
        Self::fixed()
    }
}

impl BackoffRetryPolicy {
    pub fn fixed() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            max_delay: Duration::MAX,
            jitter: 0.0,
        }
    }

    pub fn linear(max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_delay,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

impl RetryPolicy for BackoffRetryPolicy {
    fn backoff(&self, attempt: u32, base_delay: Duration) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
            BackoffStrategy::Exponential => base_ms * 2_f64.powi((attempt - 1).min(62) as i32),
        }
        .min(max_ms);

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);

    #[test]
    fn default_is_fixed_delay() {
        let policy = BackoffRetryPolicy::default();

        assert_eq!(policy.backoff(1, BASE), BASE);
        assert_eq!(policy.backoff(2, BASE), BASE);
        assert_eq!(policy.backoff(7, BASE), BASE);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffRetryPolicy::exponential(Duration::from_secs(1)).with_jitter(0.0);

        assert_eq!(policy.backoff(1, BASE), Duration::from_millis(100));
        assert_eq!(policy.backoff(2, BASE), Duration::from_millis(200));
        assert_eq!(policy.backoff(3, BASE), Duration::from_millis(400));
        assert_eq!(policy.backoff(5, BASE), Duration::from_secs(1));
        assert_eq!(policy.backoff(60, BASE), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff() {
        let policy = BackoffRetryPolicy::linear(Duration::from_secs(10));

        assert_eq!(policy.backoff(1, BASE), Duration::from_millis(100));
        assert_eq!(policy.backoff(2, BASE), Duration::from_millis(200));
        assert_eq!(policy.backoff(3, BASE), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = BackoffRetryPolicy::fixed().with_jitter(0.5);

        for attempt in 1..20 {
            let delay = policy.backoff(attempt, BASE).as_millis();
            assert!((50..=150).contains(&delay), "attempt {attempt}: {delay}ms");
        }
        assert_eq!(policy.backoff(3, BASE), policy.backoff(3, BASE));
    }

    #[test]
    fn decide_bounds_retries() {
        let policy = BackoffRetryPolicy::default();

        assert_eq!(
            policy.decide(0, 2, BASE),
            RetryDecision::RetryAfter { attempt: 1, delay: BASE }
        );
        assert_eq!(
            policy.decide(1, 2, BASE),
            RetryDecision::RetryAfter { attempt: 2, delay: BASE }
        );
        assert_eq!(policy.decide(2, 2, BASE), RetryDecision::GiveUp);
        assert_eq!(policy.decide(0, 0, BASE), RetryDecision::GiveUp);
    }
}
