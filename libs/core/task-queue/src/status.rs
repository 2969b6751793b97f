//! Status store: keyed lifecycle records with TTL.

use crate::error::QueueError;
use crate::task::{Task, TaskField, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Fields written alongside a status change.
///
/// `worker_id` is dropped automatically whenever the new status is not
/// `processing`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub last_error: Option<String>,
    pub clear_error: bool,
    pub result: Option<serde_json::Value>,
    pub worker_id: Option<String>,
    pub retry_count: Option<u32>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.clear_error = true;
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Fields to set and fields to delete for a write into `status`.
    pub fn to_fields(
        &self,
        status: TaskStatus,
    ) -> Result<(Vec<(TaskField, String)>, Vec<TaskField>), QueueError> {
        let mut set = Vec::new();
        let mut delete = Vec::new();

        match &self.last_error {
            Some(error) => set.push((TaskField::LastError, error.clone())),
            None if self.clear_error => delete.push(TaskField::LastError),
            None => {}
        }
        if let Some(result) = &self.result {
            set.push((TaskField::Result, serde_json::to_string(result)?));
        }
        if let Some(count) = self.retry_count {
            set.push((TaskField::RetryCount, count.to_string()));
        }
        match (&self.worker_id, status) {
            (Some(worker), TaskStatus::Processing) => set.push((TaskField::WorkerId, worker.clone())),
            (_, TaskStatus::Processing) => {}
            _ => delete.push(TaskField::WorkerId),
        }

        Ok((set, delete))
    }

    /// Apply to an in-memory record.
    pub fn apply(&self, task: &mut Task, status: TaskStatus, now: DateTime<Utc>) {
        if let Some(error) = &self.last_error {
            task.last_error = Some(error.clone());
        } else if self.clear_error {
            task.last_error = None;
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
        if let Some(count) = self.retry_count {
            task.retry_count = count;
        }
        if status == TaskStatus::Processing {
            if let Some(worker) = &self.worker_id {
                task.worker_id = Some(worker.clone());
            }
        } else {
            task.worker_id = None;
        }
        task.status = status;
        task.updated_at = now;
    }
}

/// Guard for compare-and-set writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Precondition {
    /// Allowed current statuses; empty allows any existing record.
    pub statuses: Vec<TaskStatus>,
    /// Only match records last written at or before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    /// Only match records held by this worker.
    pub worker_id: Option<String>,
}

impl Precondition {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status_in(statuses: &[TaskStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }

    /// Fence the write on the worker that claimed the task.
    pub fn held_by(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        let status_ok = self.statuses.is_empty() || self.statuses.contains(&task.status);
        let age_ok = self
            .updated_before
            .is_none_or(|cutoff| task.updated_at.timestamp_millis() <= cutoff.timestamp_millis());
        let holder_ok = self
            .worker_id
            .as_deref()
            .is_none_or(|worker| task.worker_id.as_deref() == Some(worker));
        status_ok && age_ok && holder_ok
    }

    /// Comma-separated status list for the Lua guards.
    pub(crate) fn status_list(&self) -> String {
        self.statuses
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Outcome of a bounded retry increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryIncrement {
    /// Counter bumped to the contained value.
    Incremented(u32),
    /// Budget already spent; counter left at the contained value.
    Exhausted(u32),
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert a new record. Returns `false` if one already exists.
    async fn create(&self, task: &Task) -> Result<bool, QueueError>;

    /// Overwrite the whole record.
    async fn save(&self, task: &Task) -> Result<(), QueueError>;

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError>;

    /// Upsert the status of an existing record and bump `updated_at`.
    ///
    /// Fails with `NotFound` when the record is gone.
    async fn set_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        update: &StatusUpdate,
    ) -> Result<Task, QueueError> {
        self.transition(task_id, &Precondition::any(), status, update)
            .await?
            .ok_or_else(|| QueueError::NotFound(task_id.clone()))
    }

    /// Compare-and-set status write. `None` when the guard did not match or
    /// the record does not exist.
    async fn transition(
        &self,
        task_id: &TaskId,
        guard: &Precondition,
        status: TaskStatus,
        update: &StatusUpdate,
    ) -> Result<Option<Task>, QueueError>;

    /// Bump `retry_count` unless it already reached `max_retries`.
    async fn increment_retry(&self, task_id: &TaskId) -> Result<RetryIncrement, QueueError>;

    /// Refresh `updated_at` of a `processing` record. `false` if not processing.
    async fn touch(&self, task_id: &TaskId) -> Result<bool, QueueError>;

    /// Number of records in a status.
    async fn count(&self, status: TaskStatus) -> Result<u64, QueueError>;

    /// Ids in a status last written at or before `cutoff`, oldest first.
    async fn updated_before(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError> {
        self.updated_before_page(status, cutoff, 0, limit).await
    }

    /// Like [`updated_before`](Self::updated_before), skipping the first
    /// `offset` matches.
    async fn updated_before_page(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError>;

    /// Delete a record if the guard matches. Index entries of the id are
    /// dropped even when the record itself already expired.
    async fn remove(&self, task_id: &TaskId, guard: &Precondition) -> Result<bool, QueueError>;

    /// Delete every record.
    async fn clear(&self) -> Result<u64, QueueError>;
}
