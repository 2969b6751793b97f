//! Terminal task events
//!
//! After a task completes or is dead-lettered the manager publishes a
//! [`TaskEvent`] so a webhook collaborator can fan it out. Publication is
//! best-effort: failures are logged and never fail the status write.
//!
//! # Example
//!
//! ```rust,ignore
//! let events = RedisEventStream::new(redis, &KeySpace::new("ingest:queue"));
//! let manager = QueueManager::redis(conn, config).with_events(Arc::new(events));
//! ```

use crate::error::QueueError;
use crate::keys::KeySpace;
use crate::task::{Task, TaskId, TaskPayload, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Outcome of a task that reached a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    /// Callback URL from a document ingest payload, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn from_task(task: &Task) -> Self {
        let callback_url = match &task.payload {
            TaskPayload::DocumentIngest(doc) => doc.callback_url.clone(),
            _ => None,
        };

        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            result: task.result.clone(),
            error: match task.status {
                TaskStatus::DeadLetter => Some(task.describe()),
                _ => None,
            },
            attempts: task.attempts(),
            callback_url,
            occurred_at: task.updated_at,
        }
    }
}

/// Destination for terminal task events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &TaskEvent) -> Result<(), QueueError>;
}

/// Publishes events to the `{prefix}:events` Redis stream.
#[derive(Clone)]
pub struct RedisEventStream {
    redis: Arc<ConnectionManager>,
    stream_name: String,
    max_length: i64,
}

impl RedisEventStream {
    pub fn new(redis: ConnectionManager, keys: &KeySpace) -> Self {
        Self::from_arc(Arc::new(redis), keys)
    }

    /// Create from an Arc<ConnectionManager> (for sharing connections).
    pub fn from_arc(redis: Arc<ConnectionManager>, keys: &KeySpace) -> Self {
        Self {
            redis,
            stream_name: keys.events(),
            max_length: 100_000,
        }
    }

    /// Set the maximum stream length (MAXLEN ~).
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
}

#[async_trait]
impl EventSink for RedisEventStream {
    async fn publish(&self, event: &TaskEvent) -> Result<(), QueueError> {
        let mut conn = (*self.redis).clone();
        let data = serde_json::to_string(event)?;

        // Approximate trimming keeps XADD O(1)
        let stream_id: String = redis::cmd("XADD")
            .arg(&self.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg("task_id")
            .arg(event.task_id.as_str())
            .arg("status")
            .arg(event.status.as_ref())
            .arg("event")
            .arg(&data)
            .query_async(&mut conn)
            .await?;

        debug!(
            stream = %self.stream_name,
            stream_id = %stream_id,
            task_id = %event.task_id,
            "Published task event"
        );

        Ok(())
    }
}
