//! Queue and worker configuration
//!
//! Both structs load from environment variables through [`FromEnv`] and can be
//! adjusted with `with_*` builder setters.

use crate::backoff::RetryPolicy;
use crate::task::TaskStatus;
use core_config::{ConfigError, FromEnv, env_or_default, env_parse};
use std::time::Duration;
use uuid::Uuid;

/// How long status records live after their last write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    /// TTL for `pending`, `processing` and `failed` records
    pub active: Duration,
    /// TTL for `completed` and `dead_letter` records
    pub terminal: Duration,
}

impl TtlPolicy {
    /// TTL applied to a record written in `status`.
    pub fn for_status(&self, status: TaskStatus) -> Duration {
        if status.is_terminal() {
            self.terminal
        } else {
            self.active
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            active: Duration::from_secs(24 * 3600),
            terminal: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Configuration shared by every component of one queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Key prefix for every Redis key of this queue
    pub key_prefix: String,

    /// Priorities at or above this value go to the priority lane
    pub priority_threshold: i32,

    /// Retry budget for tasks enqueued without an explicit one
    pub default_max_retries: u32,

    /// Status record TTLs
    pub ttl: TtlPolicy,

    /// Backoff between retries of a failed task
    pub retry: RetryPolicy,

    /// `processing` tasks without a heartbeat for this long are reclaimed
    pub stale_after: Duration,

    /// Sleep between lane polls while waiting in `dequeue`
    pub poll_interval: Duration,

    /// Maximum records touched per status by one maintenance call
    pub cleanup_batch: usize,
}

impl QueueConfig {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            priority_threshold: 5,
            default_max_retries: 3,
            ttl: TtlPolicy::default(),
            retry: RetryPolicy::default(),
            stale_after: Duration::from_secs(600),
            poll_interval: Duration::from_millis(100),
            cleanup_batch: 500,
        }
    }

    /// Set the priority lane threshold
    pub fn with_priority_threshold(mut self, threshold: i32) -> Self {
        self.priority_threshold = threshold;
        self
    }

    /// Set the default retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Set the status record TTLs
    pub fn with_ttl(mut self, active: Duration, terminal: Duration) -> Self {
        self.ttl = TtlPolicy { active, terminal };
        self
    }

    /// Set the retry backoff
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the heartbeat staleness threshold
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Set the lane poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maintenance batch size
    pub fn with_cleanup_batch(mut self, batch: usize) -> Self {
        self.cleanup_batch = batch.max(1);
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new("ingest:queue")
    }
}

impl FromEnv for QueueConfig {
    /// - `QUEUE_PREFIX` (default `ingest:queue`)
    /// - `QUEUE_PRIORITY_THRESHOLD`, `QUEUE_MAX_RETRIES`
    /// - `QUEUE_STATUS_TTL_SECS`, `QUEUE_TERMINAL_TTL_SECS`
    /// - `QUEUE_RETRY_BASE_MS`, `QUEUE_RETRY_MAX_MS`
    /// - `QUEUE_STALE_AFTER_SECS`, `QUEUE_POLL_INTERVAL_MS`, `QUEUE_CLEANUP_BATCH`
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = QueueConfig::default();

        let config = Self {
            key_prefix: env_or_default("QUEUE_PREFIX", &defaults.key_prefix),
            priority_threshold: env_parse("QUEUE_PRIORITY_THRESHOLD", defaults.priority_threshold)?,
            default_max_retries: env_parse("QUEUE_MAX_RETRIES", defaults.default_max_retries)?,
            ttl: TtlPolicy {
                active: secs("QUEUE_STATUS_TTL_SECS", defaults.ttl.active)?,
                terminal: secs("QUEUE_TERMINAL_TTL_SECS", defaults.ttl.terminal)?,
            },
            retry: RetryPolicy::new(
                millis("QUEUE_RETRY_BASE_MS", defaults.retry.base)?,
                millis("QUEUE_RETRY_MAX_MS", defaults.retry.max)?,
            ),
            stale_after: secs("QUEUE_STALE_AFTER_SECS", defaults.stale_after)?,
            poll_interval: millis("QUEUE_POLL_INTERVAL_MS", defaults.poll_interval)?,
            cleanup_batch: env_parse("QUEUE_CLEANUP_BATCH", defaults.cleanup_batch)?,
        };

        if config.key_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("QUEUE_PREFIX must not be empty".to_string()));
        }
        if config.cleanup_batch == 0 {
            return Err(ConfigError::Invalid("QUEUE_CLEANUP_BATCH must be positive".to_string()));
        }

        Ok(config)
    }
}

/// Configuration for a worker loop
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker id (auto-generated if not provided)
    pub worker_id: String,

    /// Number of worker loops per process
    pub concurrency: usize,

    /// How long one `dequeue` call waits for a task
    pub dequeue_timeout: Duration,

    /// First idle sleep after an empty poll
    pub idle_backoff_min: Duration,

    /// Cap for the idle sleep
    pub idle_backoff_max: Duration,

    /// How long an in-flight task may keep running after shutdown is signaled
    pub shutdown_grace: Duration,

    /// Interval between heartbeats while a task runs
    pub heartbeat_interval: Duration,

    /// Minimum interval between reclaim sweeps run from the idle path
    pub reap_interval: Duration,

    /// Attempts for terminal status writes before leaving the task to the reaper
    pub report_attempts: u32,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 1,
            dequeue_timeout: Duration::from_millis(1000),
            idle_backoff_min: Duration::from_millis(1000),
            idle_backoff_max: Duration::from_millis(5000),
            shutdown_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            reap_interval: Duration::from_secs(60),
            report_attempts: 5,
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the number of worker loops
    pub fn with_concurrency(mut self, count: usize) -> Self {
        self.concurrency = count.max(1);
        self
    }

    /// Set the dequeue wait
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Set the idle backoff bounds
    pub fn with_idle_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.idle_backoff_min = min;
        self.idle_backoff_max = max;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the reclaim sweep interval
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set the number of terminal report attempts
    pub fn with_report_attempts(mut self, attempts: u32) -> Self {
        self.report_attempts = attempts.max(1);
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FromEnv for WorkerConfig {
    /// - `WORKER_ID` (default `worker-<uuid>`)
    /// - `WORKER_CONCURRENCY`, `WORKER_DEQUEUE_TIMEOUT_MS`
    /// - `WORKER_IDLE_BACKOFF_MIN_MS`, `WORKER_IDLE_BACKOFF_MAX_MS`
    /// - `WORKER_SHUTDOWN_GRACE_SECS`, `WORKER_HEARTBEAT_SECS`
    /// - `WORKER_REAP_INTERVAL_SECS`, `WORKER_REPORT_ATTEMPTS`
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = WorkerConfig::new();

        let config = Self {
            worker_id: env_or_default("WORKER_ID", &defaults.worker_id),
            concurrency: env_parse("WORKER_CONCURRENCY", defaults.concurrency)?,
            dequeue_timeout: millis("WORKER_DEQUEUE_TIMEOUT_MS", defaults.dequeue_timeout)?,
            idle_backoff_min: millis("WORKER_IDLE_BACKOFF_MIN_MS", defaults.idle_backoff_min)?,
            idle_backoff_max: millis("WORKER_IDLE_BACKOFF_MAX_MS", defaults.idle_backoff_max)?,
            shutdown_grace: secs("WORKER_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            heartbeat_interval: secs("WORKER_HEARTBEAT_SECS", defaults.heartbeat_interval)?,
            reap_interval: secs("WORKER_REAP_INTERVAL_SECS", defaults.reap_interval)?,
            report_attempts: env_parse("WORKER_REPORT_ATTEMPTS", defaults.report_attempts)?,
        };

        if config.concurrency == 0 {
            return Err(ConfigError::Invalid("WORKER_CONCURRENCY must be positive".to_string()));
        }
        if config.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("WORKER_HEARTBEAT_SECS must be positive".to_string()));
        }

        let report_attempts = config.report_attempts;
        Ok(config.with_report_attempts(report_attempts))
    }
}

fn secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}
