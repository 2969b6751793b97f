//! Prometheus metrics for the task queue
//!
//! Provides observability into queue depth and worker throughput.

use crate::manager::QueueStats;
use crate::task::Lane;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// How a processing attempt ended, for labeling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    Failed,
    Panicked,
    Released,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Completed => "completed",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Panicked => "panicked",
            AttemptOutcome::Released => "released",
        }
    }
}

/// Queue metrics helper, labeled by queue prefix
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record a task being enqueued
    pub fn task_enqueued(&self, lane: Lane) {
        counter!(
            "task_queue_enqueued_total",
            "queue" => self.queue.clone(),
            "lane" => lane.to_string()
        )
        .increment(1);
    }

    /// Record a task being handed to a worker
    pub fn task_dequeued(&self) {
        counter!("task_queue_dequeued_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record a task completing
    pub fn task_completed(&self) {
        counter!("task_queue_completed_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record a task scheduled for another attempt
    pub fn task_retried(&self) {
        counter!("task_queue_retried_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record a task moved to the dead letter store
    pub fn task_dead_lettered(&self, retryable: bool) {
        counter!(
            "task_queue_dead_lettered_total",
            "queue" => self.queue.clone(),
            "reason" => if retryable { "exhausted" } else { "permanent" }
        )
        .increment(1);
    }

    /// Record stale processing tasks returned to their lane
    pub fn tasks_reclaimed(&self, count: u64) {
        counter!("task_queue_reclaimed_total", "queue" => self.queue.clone()).increment(count);
    }

    /// Record a popped id that could not be claimed
    pub fn stale_skipped(&self) {
        counter!("task_queue_stale_skipped_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record the duration of one processing attempt
    pub fn attempt_finished(&self, processor: &'static str, outcome: AttemptOutcome, duration: Duration) {
        histogram!(
            "task_queue_processing_duration_seconds",
            "queue" => self.queue.clone(),
            "processor" => processor,
            "outcome" => outcome.as_str()
        )
        .record(duration.as_secs_f64());
    }

    /// Refresh depth gauges from a stats snapshot
    pub fn record_depths(&self, stats: &QueueStats) {
        let depths = [
            ("priority", stats.priority_pending),
            ("normal", stats.normal_pending),
            ("scheduled", stats.scheduled),
            ("processing", stats.processing),
            ("dead_letter", stats.dead_letter),
        ];
        for (state, value) in depths {
            gauge!(
                "task_queue_depth",
                "queue" => self.queue.clone(),
                "state" => state
            )
            .set(value as f64);
        }
    }
}
