//! Retry/backoff policy for transient processor failures.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::tasks::model::Task;

/// What to do with a task that just failed transiently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue into its lane right away.
    RetryNow,
    /// Park as retry-pending; the scheduler promotes it once the synthetic
    /// due time arrives.
    RetryAfter(Duration),
    /// Budget exhausted: dead-letter as FAILED.
    GiveUp,
}

/// Exponential backoff with jitter, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn default_max_retries(&self) -> u32 {
        self.config.default_max_retries
    }

    /// `base * 2^retry_count + random(0, jitter)`, capped at `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << retry_count.min(20));

        let jitter_ms = self.config.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };

        Duration::from_millis(exp.saturating_add(jitter)).min(self.config.max_delay)
    }

    /// Decide the fate of `task` after a transient failure of the current
    /// attempt. Uses the pre-increment `retry_count`.
    pub fn decide(&self, task: &Task) -> RetryDecision {
        if task.retries_exhausted() {
            return RetryDecision::GiveUp;
        }

        let delay = self.delay_for(task.retry_count);
        if delay <= self.config.immediate_threshold {
            RetryDecision::RetryNow
        } else {
            RetryDecision::RetryAfter(delay)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, jitter_ms: u64, max_ms: u64, threshold_ms: u64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            base_delay: Duration::from_millis(base_ms),
            jitter: Duration::from_millis(jitter_ms),
            max_delay: Duration::from_millis(max_ms),
            immediate_threshold: Duration::from_millis(threshold_ms),
            default_max_retries: 3,
        })
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = policy(100, 0, 60_000, 0);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let policy = policy(1_000, 0, 5_000, 0);
        assert_eq!(policy.delay_for(10), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_in_window() {
        let policy = policy(100, 50, 60_000, 0);
        for _ in 0..100 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn exhausted_budget_gives_up() {
        let policy = policy(100, 0, 60_000, 0);
        let mut task = Task::new("acme", "x");
        task.retry_count = 3;
        task.max_retries = 3;
        assert_eq!(policy.decide(&task), RetryDecision::GiveUp);
    }

    #[test]
    fn small_delay_retries_immediately() {
        let policy = policy(100, 0, 60_000, 500);
        let task = Task::new("acme", "x");
        assert_eq!(policy.decide(&task), RetryDecision::RetryNow);
    }

    #[test]
    fn large_delay_defers_to_scheduler() {
        let policy = policy(1_000, 0, 60_000, 500);
        let mut task = Task::new("acme", "x");
        task.retry_count = 2;
        match policy.decide(&task) {
            RetryDecision::RetryAfter(d) => assert_eq!(d, Duration::from_millis(4_000)),
            other => panic!("expected RetryAfter, got {other:?}"),
        }
    }

    #[test]
    fn huge_retry_count_does_not_overflow() {
        let policy = policy(1_000, 0, 10_000, 0);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(10_000));
    }
}
