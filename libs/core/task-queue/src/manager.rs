//! Queue manager: the façade workers, API handlers and admin tooling use.
//!
//! State machine enforced here:
//!
//! ```text
//! pending     --dequeue-->                 processing
//! processing  --ack-->                     completed
//! processing  --fail (budget left)-->      failed --(backoff elapsed)--> pending
//! processing  --fail (budget spent)-->     dead_letter
//! processing  --fail (non-retryable)-->    dead_letter
//! processing  --reclaim / release-->       pending
//! dead_letter --retry-->                   pending (retry_count = 0)
//! ```
//!
//! Retries wait in the delayed set, which every `dequeue` and every reclaim
//! sweep promotes, so no worker sleeps while holding a retry. The `*_as`
//! variants of `ack`, `fail` and `release` are fenced on the claiming worker,
//! so a worker whose task was reclaimed cannot touch the next holder's run.

use crate::config::QueueConfig;
use crate::dlq::{self, DeadLetterEntry, DeadLetterStore};
use crate::error::QueueError;
use crate::events::{EventSink, TaskEvent};
use crate::lanes::{LaneStore, TaskQueue};
use crate::memory::MemoryBroker;
use crate::metrics::QueueMetrics;
use crate::redis_backend::RedisBroker;
use crate::status::{Precondition, RetryIncrement, StatusStore, StatusUpdate};
use crate::task::{Lane, NewTask, Task, TaskId, TaskPayload, TaskStatus};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest stretch `dequeue` waits on the lanes before re-checking the
/// delayed set.
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

/// Result of reporting a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Budget left; the task waits `delay` in the delayed set.
    Retrying { attempt: u32, delay: Duration },
    /// Moved to the dead letter store after `attempts` attempts.
    DeadLettered { attempts: u32 },
    /// The task was already final; nothing changed.
    Ignored,
}

/// Queue depth snapshot, computed from lane lengths and status indexes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ids waiting in either lane
    pub pending: u64,
    pub priority_pending: u64,
    pub normal_pending: u64,
    /// Failed tasks waiting for their backoff
    pub scheduled: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

/// Result of one `cleanup` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub completed: u64,
    pub dead_letter: u64,
    /// A batch came back full; another call will find more.
    pub has_more: bool,
}

impl CleanupReport {
    pub fn removed(&self) -> u64 {
        self.completed + self.dead_letter
    }
}

/// Result of one reclaim sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Due retries moved onto their lane
    pub promoted: usize,
    /// Stale `processing` tasks returned to `pending`
    pub reclaimed: u64,
    /// `pending`/`failed` records found in no lane and re-pushed
    pub requeued: u64,
    /// Index entries whose record had expired
    pub pruned: u64,
    /// In-flight markers cleared
    pub settled: u64,
}

/// Result of `flush`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub lane_entries: u64,
    pub records: u64,
    pub dead_letters: u64,
}

/// Entry point for every queue operation.
///
/// Construct once and share through an `Arc`.
pub struct QueueManager {
    queue: TaskQueue,
    statuses: Arc<dyn StatusStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    events: Option<Arc<dyn EventSink>>,
    metrics: QueueMetrics,
    config: QueueConfig,
    /// Rolling offsets of the orphan sweep over the pending and failed indexes
    pending_sweep: AtomicUsize,
    failed_sweep: AtomicUsize,
}

impl QueueManager {
    pub fn new(
        lanes: Arc<dyn LaneStore>,
        statuses: Arc<dyn StatusStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue: TaskQueue::new(lanes, config.priority_threshold, config.poll_interval),
            statuses,
            dead_letters,
            events: None,
            metrics: QueueMetrics::new(config.key_prefix.clone()),
            config,
            pending_sweep: AtomicUsize::new(0),
            failed_sweep: AtomicUsize::new(0),
        }
    }

    /// Manager over Redis using the key layout under `config.key_prefix`.
    pub fn redis(redis: ConnectionManager, config: QueueConfig) -> Self {
        let broker = Arc::new(RedisBroker::new(redis, config.key_prefix.clone()).with_ttl(config.ttl));
        Self::new(broker.clone(), broker.clone(), broker, config)
    }

    /// Manager over a fresh in-process broker.
    pub fn in_memory(config: QueueConfig) -> Self {
        let broker = Arc::new(MemoryBroker::new().with_ttl(config.ttl));
        Self::new(broker.clone(), broker.clone(), broker, config)
    }

    /// Publish terminal events to `events`.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Enqueue a payload with a generated id.
    pub async fn enqueue(
        &self,
        payload: TaskPayload,
        priority: i32,
        max_retries: Option<u32>,
    ) -> Result<TaskId, QueueError> {
        let mut task = NewTask::new(payload).with_priority(priority);
        if let Some(max_retries) = max_retries {
            task = task.with_max_retries(max_retries);
        }
        self.submit(task).await
    }

    /// Enqueue a fully specified task. Fails with `Duplicate` when the id
    /// already has a record.
    pub async fn submit(&self, new_task: NewTask) -> Result<TaskId, QueueError> {
        let task = new_task.into_task(self.config.default_max_retries, Utc::now());

        if !self.statuses.create(&task).await? {
            return Err(QueueError::Duplicate(task.task_id));
        }

        let lane = match self.queue.push(&task.task_id, task.priority).await {
            Ok(lane) => lane,
            Err(e) => {
                let pending = Precondition::status_in(&[TaskStatus::Pending]);
                if let Err(cleanup) = self.statuses.remove(&task.task_id, &pending).await {
                    warn!(task_id = %task.task_id, error = %cleanup, "Failed to drop record of unqueued task");
                }
                return Err(e);
            }
        };

        self.metrics.task_enqueued(lane);
        debug!(
            task_id = %task.task_id,
            lane = %lane,
            priority = task.priority,
            kind = task.payload.kind(),
            "Enqueued task"
        );

        Ok(task.task_id)
    }

    /// Claim the next task, waiting up to `timeout`.
    ///
    /// Ids whose record is gone or no longer claimable are logged and skipped.
    pub async fn dequeue(
        &self,
        timeout: Duration,
        worker_id: &str,
    ) -> Result<Option<Task>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.promote_due().await?;

            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(PROMOTE_INTERVAL);
            let Some(task_id) = self.queue.pop(wait).await? else {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                continue;
            };

            // A failed claim leaves the marker for the reaper.
            let claimed = self.claim(&task_id, worker_id).await?;
            if let Err(e) = self.queue.settle(&task_id).await {
                warn!(task_id = %task_id, error = %e, "Failed to clear in-flight marker");
            }
            if let Some(task) = claimed {
                return Ok(Some(task));
            }
        }
    }

    async fn claim(&self, task_id: &TaskId, worker_id: &str) -> Result<Option<Task>, QueueError> {
        let claimable = Precondition::status_in(&[TaskStatus::Pending, TaskStatus::Failed]);
        let update = StatusUpdate::new().worker(worker_id);

        match self
            .statuses
            .transition(task_id, &claimable, TaskStatus::Processing, &update)
            .await?
        {
            Some(task) => {
                self.metrics.task_dequeued();
                debug!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    retry_count = task.retry_count,
                    "Dequeued task"
                );
                Ok(Some(task))
            }
            None => {
                self.metrics.stale_skipped();
                warn!(task_id = %task_id, "Skipping stale or unknown task id");
                Ok(None)
            }
        }
    }

    /// Mark a task completed with its result.
    ///
    /// Accepts `processing` tasks and `failed` ones waiting for a retry.
    /// Returns `false` when the task is final or back in its lane.
    pub async fn ack(&self, task_id: &TaskId, result: serde_json::Value) -> Result<bool, QueueError> {
        let held = Precondition::status_in(&[TaskStatus::Processing, TaskStatus::Failed]);
        self.complete(task_id, &held, result).await
    }

    /// [`ack`](Self::ack) for the run `worker_id` claimed.
    pub async fn ack_as(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<bool, QueueError> {
        let held = Precondition::status_in(&[TaskStatus::Processing]).held_by(worker_id);
        self.complete(task_id, &held, result).await
    }

    async fn complete(
        &self,
        task_id: &TaskId,
        held: &Precondition,
        result: serde_json::Value,
    ) -> Result<bool, QueueError> {
        let update = StatusUpdate::new().result(result);

        if let Some(task) = self
            .statuses
            .transition(task_id, held, TaskStatus::Completed, &update)
            .await?
        {
            self.metrics.task_completed();
            info!(task_id = %task_id, attempts = task.attempts(), "Task completed");
            self.discard_queued(&task).await;
            self.publish(&task).await;
            return Ok(true);
        }

        match self.statuses.get(task_id).await? {
            Some(task) => {
                debug!(task_id = %task_id, status = %task.status, "Ack ignored, task not held");
                Ok(false)
            }
            None => Err(QueueError::NotFound(task_id.clone())),
        }
    }

    /// Report a failed attempt of a `processing` task.
    ///
    /// Retryable failures with budget left are scheduled with exponential
    /// backoff; everything else is dead-lettered. Tasks that are not
    /// processing are left alone.
    pub async fn fail(
        &self,
        task_id: &TaskId,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let held = Precondition::status_in(&[TaskStatus::Processing]);
        self.record_failure(task_id, &held, error, retryable).await
    }

    /// [`fail`](Self::fail) for the run `worker_id` claimed.
    pub async fn fail_as(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let held = Precondition::status_in(&[TaskStatus::Processing]).held_by(worker_id);
        self.record_failure(task_id, &held, error, retryable).await
    }

    async fn record_failure(
        &self,
        task_id: &TaskId,
        held: &Precondition,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let update = StatusUpdate::new().error(error);
        let Some(task) = self
            .statuses
            .transition(task_id, held, TaskStatus::Failed, &update)
            .await?
        else {
            return match self.statuses.get(task_id).await? {
                Some(task) => {
                    debug!(task_id = %task_id, status = %task.status, "Fail ignored, task not held");
                    Ok(FailOutcome::Ignored)
                }
                None => Err(QueueError::NotFound(task_id.clone())),
            };
        };

        if !retryable {
            return self.dead_letter(task, error, false).await;
        }

        let attempt = match self.statuses.increment_retry(task_id).await? {
            RetryIncrement::Incremented(attempt) => attempt,
            RetryIncrement::Exhausted(_) => return self.dead_letter(task, error, true).await,
        };

        let delay = self.config.retry.delay_for(attempt);
        self.queue
            .schedule(task_id, task.priority, after(Utc::now(), delay))
            .await?;

        self.metrics.task_retried();
        warn!(
            task_id = %task_id,
            attempt = attempt,
            max_retries = task.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Task failed, retry scheduled"
        );

        Ok(FailOutcome::Retrying { attempt, delay })
    }

    /// Move a task just marked `failed` to the dead letter store.
    async fn dead_letter(
        &self,
        task: Task,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let now = Utc::now();
        let mut snapshot = task;
        snapshot.status = TaskStatus::DeadLetter;
        snapshot.last_error = Some(error.to_string());
        snapshot.worker_id = None;
        snapshot.updated_at = now;

        let entry = DeadLetterEntry::new(snapshot, error, now);
        self.dead_letters.add(&entry).await?;

        let failed = Precondition::status_in(&[TaskStatus::Failed]);
        let update = StatusUpdate::new().error(error);
        match self
            .statuses
            .transition(entry.task_id(), &failed, TaskStatus::DeadLetter, &update)
            .await?
        {
            Some(task) => {
                self.metrics.task_dead_lettered(retryable);
                warn!(
                    task_id = %task.task_id,
                    attempts = entry.attempts,
                    retryable = retryable,
                    error = %error,
                    "Moved task to dead letter store"
                );
                self.discard_queued(&task).await;
                self.publish(&task).await;
                Ok(FailOutcome::DeadLettered {
                    attempts: entry.attempts,
                })
            }
            None => {
                // Acked in the meantime
                self.dead_letters.remove(entry.task_id()).await?;
                Ok(FailOutcome::Ignored)
            }
        }
    }

    /// Return a `processing` task to its lane, e.g. when a worker gives up on
    /// it during shutdown.
    pub async fn release(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let held = Precondition::status_in(&[TaskStatus::Processing]);
        self.return_to_lane(task_id, &held).await
    }

    /// [`release`](Self::release) for the run `worker_id` claimed.
    pub async fn release_as(&self, task_id: &TaskId, worker_id: &str) -> Result<bool, QueueError> {
        let held = Precondition::status_in(&[TaskStatus::Processing]).held_by(worker_id);
        self.return_to_lane(task_id, &held).await
    }

    async fn return_to_lane(&self, task_id: &TaskId, held: &Precondition) -> Result<bool, QueueError> {
        let Some(task) = self
            .statuses
            .transition(task_id, held, TaskStatus::Pending, &StatusUpdate::new())
            .await?
        else {
            return Ok(false);
        };

        let lane = self.queue.push(task_id, task.priority).await?;
        info!(task_id = %task_id, lane = %lane, "Released task back to its lane");
        Ok(true)
    }

    /// Refresh the heartbeat of a `processing` task.
    pub async fn heartbeat(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        self.statuses.touch(task_id).await
    }

    /// Move a dead-lettered task back to `pending` with a fresh budget.
    pub async fn retry(&self, task_id: &TaskId) -> Result<Task, QueueError> {
        let task = dlq::requeue(
            self.dead_letters.as_ref(),
            self.statuses.as_ref(),
            &self.queue,
            task_id,
        )
        .await?;

        self.metrics.task_enqueued(Lane::Normal);
        Ok(task)
    }

    pub async fn get_status(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError> {
        self.statuses.get(task_id).await
    }

    /// Counts per state from lane lengths and status indexes.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let priority_pending = self.queue.len(Lane::Priority).await?;
        let normal_pending = self.queue.len(Lane::Normal).await?;

        let stats = QueueStats {
            pending: priority_pending + normal_pending,
            priority_pending,
            normal_pending,
            scheduled: self.queue.scheduled_len().await?,
            processing: self.statuses.count(TaskStatus::Processing).await?,
            completed: self.statuses.count(TaskStatus::Completed).await?,
            failed: self.statuses.count(TaskStatus::Failed).await?,
            dead_letter: self.dead_letters.len().await?,
        };

        self.metrics.record_depths(&stats);
        Ok(stats)
    }

    /// Remove terminal records last written more than `older_than` ago.
    ///
    /// Touches at most `cleanup_batch` records per status; dead letter
    /// entries themselves are kept.
    pub async fn cleanup(&self, older_than: Duration) -> Result<CleanupReport, QueueError> {
        let cutoff = before(Utc::now(), older_than);
        let batch = self.config.cleanup_batch;
        let mut report = CleanupReport::default();

        for status in [TaskStatus::Completed, TaskStatus::DeadLetter] {
            let ids = self.statuses.updated_before(status, cutoff, batch).await?;
            report.has_more |= ids.len() >= batch;

            let guard = Precondition::status_in(&[status]).updated_before(cutoff);
            let mut removed = 0;
            for task_id in ids {
                if self.statuses.remove(&task_id, &guard).await? {
                    removed += 1;
                }
            }

            match status {
                TaskStatus::Completed => report.completed = removed,
                _ => report.dead_letter = removed,
            }
        }

        info!(
            completed = report.completed,
            dead_letter = report.dead_letter,
            has_more = report.has_more,
            "Cleaned up terminal records"
        );

        Ok(report)
    }

    /// Move due retries onto their lanes and flip them back to `pending`.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let promoted = self
            .queue
            .promote_due(Utc::now(), self.config.cleanup_batch)
            .await?;

        let failed = Precondition::status_in(&[TaskStatus::Failed]);
        for task_id in &promoted {
            self.statuses
                .transition(task_id, &failed, TaskStatus::Pending, &StatusUpdate::new())
                .await?;
        }

        Ok(promoted.len())
    }

    /// Reaper sweep.
    ///
    /// - promotes due retries
    /// - returns `processing` tasks without a heartbeat for `stale_after` to `pending`
    /// - re-pushes tasks popped at least `stale_after` ago but never claimed
    /// - walks the `pending`/`failed` indexes, a page per sweep, re-pushing
    ///   records that sit in no lane and no delayed slot
    /// - prunes index entries of records past their TTL
    pub async fn reclaim_stale(&self, stale_after: Duration) -> Result<ReclaimReport, QueueError> {
        let now = Utc::now();
        let cutoff = before(now, stale_after);
        let batch = self.config.cleanup_batch;
        let mut report = ReclaimReport {
            promoted: self.promote_due().await?,
            ..ReclaimReport::default()
        };

        let stale = Precondition::status_in(&[TaskStatus::Processing]).updated_before(cutoff);
        for task_id in self
            .statuses
            .updated_before(TaskStatus::Processing, cutoff, batch)
            .await?
        {
            match self
                .statuses
                .transition(&task_id, &stale, TaskStatus::Pending, &StatusUpdate::new())
                .await?
            {
                Some(task) => {
                    self.queue.push(&task_id, task.priority).await?;
                    report.reclaimed += 1;
                    warn!(task_id = %task_id, "Reclaimed stale processing task");
                }
                None => report.pruned += self.prune_if_missing(&task_id).await?,
            }
        }

        for task_id in self.queue.unsettled(cutoff, batch).await? {
            if self.queue.settle(&task_id).await? {
                report.settled += 1;
            }
            let Some(task) = self.statuses.get(&task_id).await? else {
                continue;
            };
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Failed)
                && !self.queue.contains(&task_id, task.priority).await?
                && self.requeue_orphan(&task).await?
            {
                report.requeued += 1;
                warn!(task_id = %task_id, "Re-pushed task popped but never claimed");
            }
        }

        for (status, cursor) in [
            (TaskStatus::Pending, &self.pending_sweep),
            (TaskStatus::Failed, &self.failed_sweep),
        ] {
            let offset = cursor.load(Ordering::Relaxed);
            let page = self
                .statuses
                .updated_before_page(status, cutoff, offset, batch)
                .await?;
            let next = if page.len() < batch { 0 } else { offset + page.len() };
            cursor.store(next, Ordering::Relaxed);

            for task_id in page {
                let Some(task) = self.statuses.get(&task_id).await? else {
                    report.pruned += self.prune_if_missing(&task_id).await?;
                    continue;
                };
                if task.status != status
                    || self.queue.is_in_flight(&task_id).await?
                    || self.queue.contains(&task_id, task.priority).await?
                {
                    continue;
                }
                if self.requeue_orphan(&task).await? {
                    report.requeued += 1;
                    warn!(task_id = %task_id, status = %status, "Re-pushed task missing from every lane");
                }
            }
        }

        for status in TaskStatus::all() {
            let expired = before(now, self.config.ttl.for_status(status));
            for task_id in self.statuses.updated_before(status, expired, batch).await? {
                report.pruned += self.prune_if_missing(&task_id).await?;
            }
        }

        self.metrics.tasks_reclaimed(report.reclaimed + report.requeued);
        if report.reclaimed + report.requeued + report.pruned > 0 {
            info!(
                reclaimed = report.reclaimed,
                requeued = report.requeued,
                pruned = report.pruned,
                settled = report.settled,
                "Reclaim sweep finished"
            );
        }

        Ok(report)
    }

    /// Flip an orphaned `pending`/`failed` record to `pending` and push it.
    async fn requeue_orphan(&self, task: &Task) -> Result<bool, QueueError> {
        let unchanged = Precondition::status_in(&[task.status]);
        let Some(task) = self
            .statuses
            .transition(&task.task_id, &unchanged, TaskStatus::Pending, &StatusUpdate::new())
            .await?
        else {
            return Ok(false);
        };

        self.queue.push(&task.task_id, task.priority).await?;
        Ok(true)
    }

    async fn prune_if_missing(&self, task_id: &TaskId) -> Result<u64, QueueError> {
        if self.statuses.get(task_id).await?.is_some() {
            return Ok(0);
        }
        self.statuses.remove(task_id, &Precondition::any()).await?;
        debug!(task_id = %task_id, "Pruned index entry of expired record");
        Ok(1)
    }

    /// Dead letter entries, oldest first.
    pub async fn dead_letters(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        self.dead_letters.list(limit, offset).await
    }

    /// Delete every lane entry, status record and dead letter of this queue.
    pub async fn flush(&self) -> Result<FlushReport, QueueError> {
        let report = FlushReport {
            lane_entries: self.queue.clear().await?,
            records: self.statuses.clear().await?,
            dead_letters: self.dead_letters.clear().await?,
        };

        warn!(
            queue = %self.config.key_prefix,
            lane_entries = report.lane_entries,
            records = report.records,
            dead_letters = report.dead_letters,
            "Flushed queue"
        );

        Ok(report)
    }

    /// Broker liveness check.
    pub async fn ping(&self) -> Result<(), QueueError> {
        self.queue.ping().await
    }

    /// Drop lane or delayed entries left behind by a task that just went
    /// final, e.g. a pending retry of a task acked from `failed`.
    async fn discard_queued(&self, task: &Task) {
        match self.queue.remove(&task.task_id, task.priority).await {
            Ok(0) => {}
            Ok(removed) => debug!(task_id = %task.task_id, removed = removed, "Discarded queued entries of final task"),
            Err(e) => warn!(task_id = %task.task_id, error = %e, "Failed to discard queued entries"),
        }
    }

    async fn publish(&self, task: &Task) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(e) = events.publish(&TaskEvent::from_task(task)).await {
            warn!(task_id = %task.task_id, error = %e, "Failed to publish task event");
        }
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use serde_json::json;

    fn manager() -> QueueManager {
        QueueManager::in_memory(
            QueueConfig::new("test:queue")
                .with_retry_policy(RetryPolicy::immediate())
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    fn payload() -> TaskPayload {
        TaskPayload::json(json!({"doc": "a.pdf"}))
    }

    #[tokio::test]
    async fn test_submit_rejects_duplicate_id() {
        let manager = manager();
        manager.submit(NewTask::new(payload()).with_id("t1")).await.unwrap();

        let err = manager
            .submit(NewTask::new(payload()).with_id("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Duplicate(id) if id.as_str() == "t1"));
    }

    #[tokio::test]
    async fn test_dequeue_empty_returns_none() {
        let manager = manager();
        let task = manager.dequeue(Duration::from_millis(20), "w1").await.unwrap();
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_claims_task() {
        let manager = manager();
        let id = manager.enqueue(payload(), 0, None).await.unwrap();

        let task = manager.dequeue(Duration::ZERO, "w1").await.unwrap().unwrap();
        assert_eq!(task.task_id, id);
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let manager = manager();
        let id = manager.enqueue(payload(), 0, None).await.unwrap();
        manager.dequeue(Duration::ZERO, "w1").await.unwrap();

        assert!(manager.ack(&id, json!({"chunks": 2})).await.unwrap());
        assert!(!manager.ack(&id, json!({"chunks": 9})).await.unwrap());

        let task = manager.get_status(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"chunks": 2})));
    }

    #[tokio::test]
    async fn test_ack_unknown_task() {
        let err = manager().ack(&TaskId::new("ghost"), json!(null)).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_dead_letters_immediately() {
        let manager = manager();
        let id = manager.enqueue(payload(), 0, Some(5)).await.unwrap();
        manager.dequeue(Duration::ZERO, "w1").await.unwrap();

        let outcome = manager.fail(&id, "unsupported format", false).await.unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered { attempts: 1 });

        let task = manager.get_status(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::DeadLetter);
        assert_eq!(task.retry_count, 0);
        assert_eq!(manager.dead_letters(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_schedules_retry_with_backoff() {
        let manager = QueueManager::in_memory(QueueConfig::new("test:queue").with_retry_policy(
            RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(600)),
        ));
        let id = manager.enqueue(payload(), 0, None).await.unwrap();
        manager.dequeue(Duration::ZERO, "w1").await.unwrap();

        let outcome = manager.fail(&id, "timeout", true).await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_secs(60)
            }
        );

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.pending, 0);

        // Not due yet
        assert!(manager.dequeue(Duration::ZERO, "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_returns_task_to_lane() {
        let manager = manager();
        let id = manager.enqueue(payload(), 9, None).await.unwrap();
        manager.dequeue(Duration::ZERO, "w1").await.unwrap();

        assert!(manager.release(&id).await.unwrap());
        assert!(!manager.release(&id).await.unwrap());

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.priority_pending, 1);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn test_stale_id_is_skipped() {
        let manager = manager();
        let id = manager.enqueue(payload(), 0, None).await.unwrap();
        manager.dequeue(Duration::ZERO, "w1").await.unwrap();

        // Duplicate lane entry for a task that is already held
        manager.queue.push(&id, 0).await.unwrap();
        assert!(manager.dequeue(Duration::ZERO, "w2").await.unwrap().is_none());
        assert_eq!(manager.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_retry_rejects_live_task() {
        let manager = manager();
        let id = manager.enqueue(payload(), 0, None).await.unwrap();

        let err = manager.retry(&id).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::NotDeadLettered {
                status: TaskStatus::Pending,
                ..
            }
        ));
        assert!(matches!(
            manager.retry(&TaskId::new("ghost")).await.unwrap_err(),
            QueueError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_ack_during_backoff_discards_scheduled_retry() {
        let manager = QueueManager::in_memory(QueueConfig::new("test:queue").with_retry_policy(
            RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(600)),
        ));
        let id = manager.enqueue(payload(), 0, None).await.unwrap();
        manager.dequeue(Duration::ZERO, "w1").await.unwrap();
        manager.fail(&id, "timeout", true).await.unwrap();

        assert!(manager.ack(&id, json!({"late": true})).await.unwrap());
        assert_eq!(manager.stats().await.unwrap().scheduled, 0);
    }

    #[tokio::test]
    async fn test_flush_empties_everything() {
        let manager = manager();
        manager.enqueue(payload(), 0, None).await.unwrap();
        let id = manager.enqueue(payload(), 0, Some(0)).await.unwrap();
        manager.dequeue(Duration::ZERO, "w1").await.unwrap();
        manager.dequeue(Duration::ZERO, "w1").await.unwrap();
        manager.fail(&id, "boom", true).await.unwrap();

        let report = manager.flush().await.unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.dead_letters, 1);
        assert_eq!(manager.stats().await.unwrap(), QueueStats::default());
    }

    #[test]
    fn test_time_helpers_saturate() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(before(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(after(now, Duration::from_secs(1)) - now, chrono::Duration::seconds(1));
    }
}
