//! Worker loop: dequeue → processor → ack/fail.
//!
//! Each [`Worker`] owns one loop and processes one task at a time; run
//! several for concurrency. The worker:
//! - backs off while the lanes are empty (doubling up to a cap)
//! - backs off on broker errors (2^n seconds, capped at 30s)
//! - heartbeats while a task runs so the reaper leaves it alone
//! - runs the processor in its own task, turning panics into retryable failures
//! - on shutdown, gives the in-flight task a grace period, then releases it

use crate::backoff::{IdleBackoff, error_backoff};
use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::manager::QueueManager;
use crate::metrics::AttemptOutcome;
use crate::processor::TaskProcessor;
use crate::task::Task;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// First delay between retries of a terminal status write.
const REPORT_RETRY_DELAY: Duration = Duration::from_millis(200);
const REPORT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Terminal write owed to the manager after an attempt.
#[derive(Debug, Clone)]
enum Report {
    Ack(serde_json::Value),
    Fail { error: String, retryable: bool },
    Release,
}

impl Report {
    fn name(&self) -> &'static str {
        match self {
            Report::Ack(_) => "ack",
            Report::Fail { .. } => "fail",
            Report::Release => "release",
        }
    }
}

/// Single worker loop over a shared [`QueueManager`].
pub struct Worker<P: TaskProcessor> {
    manager: Arc<QueueManager>,
    processor: Arc<P>,
    config: WorkerConfig,
}

impl<P> Worker<P>
where
    P: TaskProcessor + 'static,
{
    pub fn new(manager: Arc<QueueManager>, processor: P, config: WorkerConfig) -> Self {
        Self::with_arc_processor(manager, Arc::new(processor), config)
    }

    /// Create a worker sharing a processor with other workers.
    pub fn with_arc_processor(
        manager: Arc<QueueManager>,
        processor: Arc<P>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            manager,
            processor,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(
            worker_id = %self.config.worker_id,
            queue = %self.manager.config().key_prefix,
            processor = %self.processor.name(),
            "Starting worker"
        );

        let mut idle = IdleBackoff::new(self.config.idle_backoff_min, self.config.idle_backoff_max);
        let mut consecutive_errors: u32 = 0;
        let mut last_reap = Instant::now();

        loop {
            if *shutdown.borrow() {
                info!(worker_id = %self.config.worker_id, "Received shutdown signal, stopping worker");
                break;
            }

            match self
                .manager
                .dequeue(self.config.dequeue_timeout, &self.config.worker_id)
                .await
            {
                Ok(Some(task)) => {
                    if consecutive_errors > 0 {
                        info!("Connection recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }
                    idle.reset();
                    self.handle(task, &mut shutdown).await;
                }
                Ok(None) => {
                    if consecutive_errors > 0 {
                        info!("Connection recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }

                    if last_reap.elapsed() >= self.config.reap_interval {
                        self.reap().await;
                        last_reap = Instant::now();
                    }

                    let delay = idle.next_delay();
                    debug!(delay_ms = delay.as_millis() as u64, "No tasks, idling");
                    if sleep_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = error_backoff(consecutive_errors);

                    if e.is_connection_error() {
                        warn!(
                            error = %e,
                            consecutive_errors = %consecutive_errors,
                            backoff_secs = backoff.as_secs(),
                            "Broker connection error, backing off"
                        );
                    } else {
                        error!(
                            error = %e,
                            consecutive_errors = %consecutive_errors,
                            backoff_secs = backoff.as_secs(),
                            "Error dequeuing task"
                        );
                    }

                    if sleep_or_shutdown(&mut shutdown, backoff).await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    /// Process one claimed task and report its outcome.
    async fn handle(&self, task: Task, shutdown: &mut watch::Receiver<bool>) {
        let started = Instant::now();
        let processor = Arc::clone(&self.processor);
        let input = task.clone();
        let mut running = tokio::spawn(async move { processor.process(&input).await });

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut deadline: Option<Instant> = None;
        let mut shutdown_seen = *shutdown.borrow();
        if shutdown_seen {
            deadline = Some(Instant::now() + self.config.shutdown_grace);
        }

        let joined = loop {
            tokio::select! {
                joined = &mut running => break Some(joined),
                _ = heartbeat.tick() => {
                    match self.manager.heartbeat(&task.task_id).await {
                        Ok(true) => debug!(task_id = %task.task_id, "Heartbeat"),
                        Ok(false) => warn!(task_id = %task.task_id, "Heartbeat found task no longer processing"),
                        Err(e) => warn!(task_id = %task.task_id, error = %e, "Heartbeat failed"),
                    }
                }
                changed = shutdown.changed(), if !shutdown_seen => {
                    if changed.is_err() || *shutdown.borrow() {
                        shutdown_seen = true;
                        deadline = Some(Instant::now() + self.config.shutdown_grace);
                        info!(
                            task_id = %task.task_id,
                            grace_secs = self.config.shutdown_grace.as_secs(),
                            "Shutdown requested, finishing in-flight task"
                        );
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    running.abort();
                    break None;
                }
            }
        };

        let elapsed = started.elapsed();
        let name = self.processor.name();
        let metrics = self.manager.metrics();

        let report = match joined {
            Some(Ok(Ok(result))) => {
                metrics.attempt_finished(name, AttemptOutcome::Completed, elapsed);
                debug!(task_id = %task.task_id, elapsed_ms = elapsed.as_millis() as u64, "Task processed");
                Report::Ack(result)
            }
            Some(Ok(Err(e))) => {
                metrics.attempt_finished(name, AttemptOutcome::Failed, elapsed);
                let retryable = e.is_retryable();
                warn!(
                    task_id = %task.task_id,
                    error = %e,
                    retryable,
                    "Task processing failed"
                );
                Report::Fail {
                    error: e.message,
                    retryable,
                }
            }
            Some(Err(join_error)) => {
                metrics.attempt_finished(name, AttemptOutcome::Panicked, elapsed);
                let message = describe_join_error(join_error);
                error!(task_id = %task.task_id, error = %message, "Processor panicked");
                Report::Fail {
                    error: message,
                    retryable: true,
                }
            }
            None => {
                metrics.attempt_finished(name, AttemptOutcome::Released, elapsed);
                warn!(
                    task_id = %task.task_id,
                    "Grace period expired, releasing in-flight task"
                );
                Report::Release
            }
        };

        self.report(&task, report).await;
    }

    /// Deliver a terminal write, retrying connection errors a bounded number
    /// of times. Anything left undelivered is picked up by the reaper.
    async fn report(&self, task: &Task, report: Report) {
        let mut delay = REPORT_RETRY_DELAY;

        let worker_id = self.config.worker_id.as_str();

        for attempt in 1..=self.config.report_attempts {
            let result = match &report {
                Report::Ack(value) => self
                    .manager
                    .ack_as(&task.task_id, worker_id, value.clone())
                    .await
                    .map(|_| ()),
                Report::Fail { error, retryable } => self
                    .manager
                    .fail_as(&task.task_id, worker_id, error, *retryable)
                    .await
                    .map(|_| ()),
                Report::Release => self
                    .manager
                    .release_as(&task.task_id, worker_id)
                    .await
                    .map(|_| ()),
            };

            match result {
                Ok(()) => return,
                Err(e) if e.is_connection_error() && attempt < self.config.report_attempts => {
                    warn!(
                        task_id = %task.task_id,
                        op = report.name(),
                        attempt = attempt,
                        error = %e,
                        "Status write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(REPORT_RETRY_MAX_DELAY);
                }
                Err(e) => {
                    error!(
                        task_id = %task.task_id,
                        op = report.name(),
                        error = %e,
                        "Giving up on status write, leaving task for the reaper"
                    );
                    return;
                }
            }
        }
    }

    async fn reap(&self) {
        match self
            .manager
            .reclaim_stale(self.manager.config().stale_after)
            .await
        {
            Ok(report) => debug!(?report, "Reclaim sweep"),
            Err(e) => warn!(error = %e, "Reclaim sweep failed"),
        }
    }
}

/// Sleep for `delay`; returns `true` if shutdown was signaled meanwhile.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
                info!("Received shutdown signal, stopping worker");
                return true;
            }
            false
        }
        _ = tokio::time::sleep(delay) => false,
    }
}

fn describe_join_error(error: JoinError) -> String {
    if !error.is_panic() {
        return format!("processor task cancelled: {}", error);
    }
    let panic = error.into_panic();
    format!("processor panicked: {}", panic_message(panic.as_ref()))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
