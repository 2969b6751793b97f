//! Dead letter store
//!
//! Holds tasks that exhausted their retries or failed permanently. Entries
//! persist until they are requeued or cleared by hand.

use crate::error::QueueError;
use crate::lanes::TaskQueue;
use crate::status::StatusStore;
use crate::task::{Lane, Task, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Dead letter entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Full task as it was when dead-lettered
    pub task: Task,

    /// Error message that caused the final failure
    pub error: String,

    /// Number of processing attempts made
    pub attempts: u32,

    /// When the task was moved to the dead letter store
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(task: Task, error: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        Self {
            attempts: task.attempts(),
            task,
            error: error.into(),
            failed_at,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.task_id
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert or replace the entry of a task.
    async fn add(&self, entry: &DeadLetterEntry) -> Result<(), QueueError>;

    async fn get(&self, task_id: &TaskId) -> Result<Option<DeadLetterEntry>, QueueError>;

    /// Entries ordered by `failed_at`, oldest first.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    async fn remove(&self, task_id: &TaskId) -> Result<bool, QueueError>;

    async fn len(&self) -> Result<u64, QueueError>;

    async fn clear(&self) -> Result<u64, QueueError>;
}

/// Move a dead-lettered task back onto the normal lane with a fresh budget.
///
/// The status record is rewritten before the push and the entry is removed
/// last, so a crash in between leaves the task recoverable by the reaper or a
/// second `requeue`.
pub async fn requeue(
    dead_letters: &dyn DeadLetterStore,
    statuses: &dyn StatusStore,
    queue: &TaskQueue,
    task_id: &TaskId,
) -> Result<Task, QueueError> {
    let Some(entry) = dead_letters.get(task_id).await? else {
        return match statuses.get(task_id).await? {
            Some(task) => Err(QueueError::NotDeadLettered {
                task_id: task_id.clone(),
                status: task.status,
            }),
            None => Err(QueueError::NotFound(task_id.clone())),
        };
    };

    let mut task = entry.task;
    task.status = TaskStatus::Pending;
    task.retry_count = 0;
    task.last_error = None;
    task.result = None;
    task.worker_id = None;
    task.updated_at = Utc::now();

    statuses.save(&task).await?;
    queue.push_to(&task.task_id, Lane::Normal).await?;
    dead_letters.remove(task_id).await?;

    info!(
        task_id = %task_id,
        previous_attempts = entry.attempts,
        "Requeued dead-lettered task"
    );

    Ok(task)
}
