//! Tunables for the reconciliation engine and the worker assembly.

use std::time::Duration;

use uuid::Uuid;

use crate::retry::{BackoffConfig, RetryPolicy, DEFAULT_EXPONENTIAL_MULTIPLIER};

/// Knobs for one informer instance.
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Period of the full want/real resync sweep. Watch events cover the
    /// common path; the sweep catches anything the watch missed.
    pub resync_interval: Duration,

    /// How long a terminal-status cache entry survives before eviction.
    pub recycle_after: Duration,

    /// Buffer size of the trigger fan-in channel.
    pub trigger_buffer: usize,

    /// Retry budget for recorder status write-backs.
    pub write_retry: RetryPolicy,

    /// Backoff shape for re-establishing a broken runnable-task watch.
    /// Resync keeps the informer converging while the watch is down.
    pub watch_backoff: BackoffConfig,

    /// Ceiling on the watch reconnect delay.
    pub watch_backoff_max: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            recycle_after: Duration::from_secs(60),
            trigger_buffer: 16,
            write_retry: RetryPolicy::default(),
            watch_backoff: BackoffConfig::Exponential {
                base_delay_ms: 200,
                multiplier: DEFAULT_EXPONENTIAL_MULTIPLIER,
            },
            watch_backoff_max: Duration::from_secs(30),
        }
    }
}

impl InformerConfig {
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_recycle_after(mut self, recycle_after: Duration) -> Self {
        self.recycle_after = recycle_after;
        self
    }

    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }
}

/// Knobs for the worker assembly around one informer.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identity of this worker in the scheduling plane.
    pub worker_id: String,

    pub informer: InformerConfig,

    /// Budget for draining in-flight changes on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            informer: InformerConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_informer(mut self, informer: InformerConfig) -> Self {
        self.informer = informer;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn informer_defaults() {
        let config = InformerConfig::default();
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.recycle_after, Duration::from_secs(60));
        assert_eq!(config.write_retry.max_attempts, 3);
    }

    #[test]
    fn worker_ids_are_unique_by_default() {
        let a = WorkerConfig::default();
        let b = WorkerConfig::default();
        assert_ne!(a.worker_id, b.worker_id);
        assert!(a.worker_id.starts_with("worker-"));
    }
}
