//! Configuration types.

use std::time::Duration;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers. Bounds maximum in-flight tasks.
    pub worker_count: usize,
    /// How long a blocking dequeue waits before the worker re-polls.
    pub dequeue_timeout: Duration,
    /// Maximum wall-clock time a single execution attempt may run before
    /// the watchdog treats it as a transient failure.
    pub execution_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            dequeue_timeout: Duration::from_secs(5),
            execution_deadline: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// Retry/backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for the exponential backoff curve.
    pub base_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Delays at or below this are re-enqueued immediately instead of
    /// going through the scheduler's due-time mechanism.
    pub immediate_threshold: Duration,
    /// Retry budget used when a processor does not declare its own.
    pub default_max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            jitter: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // 5 minutes
            immediate_threshold: Duration::from_secs(3),
            default_max_retries: 3,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between due-task scans.
    pub scan_interval: Duration,
    /// Maximum tasks promoted per scan.
    pub scan_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            scan_batch: 100,
        }
    }
}

/// Intent parsing configuration.
#[derive(Debug, Clone)]
pub struct IntentConfig {
    /// Parses below this confidence route to the default processor.
    pub confidence_threshold: f32,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default)]
pub struct TaskhubConfig {
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub intent: IntentConfig,
}

impl TaskhubConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("TASKHUB_WORKERS") {
            config.worker.worker_count = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("TASKHUB_EXECUTION_DEADLINE_SECS") {
            config.worker.execution_deadline = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TASKHUB_SCAN_INTERVAL_SECS") {
            config.scheduler.scan_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parse::<u64>("TASKHUB_RETRY_BASE_SECS") {
            config.retry.base_delay = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("TASKHUB_MAX_RETRIES") {
            config.retry.default_max_retries = n;
        }
        if let Some(t) = env_parse::<f32>("TASKHUB_INTENT_THRESHOLD") {
            config.intent.confidence_threshold = t.clamp(0.0, 1.0);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = TaskhubConfig::default();
        assert!(config.worker.worker_count >= 1);
        assert!(config.retry.max_delay >= config.retry.base_delay);
        assert!(config.intent.confidence_threshold <= 1.0);
    }
}
