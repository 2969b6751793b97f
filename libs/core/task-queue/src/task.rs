//! Task data model.
//!
//! A [`Task`] is the full record tracked by the status store: identity,
//! payload, lane priority, lifecycle status and retry bookkeeping. Records are
//! stored in Redis as flat hashes, so this module also owns the field codec.

use crate::error::QueueError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

/// Unique identifier of a task.
///
/// Callers may supply their own ids (e.g. a document id); otherwise
/// [`TaskId::generate`] produces a time-ordered UUIDv7.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in a lane.
    Pending,
    /// Held by exactly one worker.
    Processing,
    /// Finished successfully; result stored.
    Completed,
    /// Last attempt failed; waiting for its backoff to elapse.
    Failed,
    /// Retry budget exhausted or permanent failure.
    DeadLetter,
}

impl TaskStatus {
    /// Terminal states are never left except through an explicit `retry`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLetter)
    }

    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }
}

/// One of the two pending lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Priority,
    Normal,
}

impl Lane {
    /// Lane for a priority value; values at or above `threshold` go first.
    pub fn for_priority(priority: i32, threshold: i32) -> Self {
        if priority >= threshold {
            Lane::Priority
        } else {
            Lane::Normal
        }
    }

    /// Lanes in drain order.
    pub fn drain_order() -> [Lane; 2] {
        [Lane::Priority, Lane::Normal]
    }
}

/// Document ingestion request as produced by the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentIngest {
    pub document_id: String,
    pub source_url: String,
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Work description handed to the processor.
///
/// The queue never interprets payloads; only the processor decodes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    DocumentIngest(DocumentIngest),
    /// Arbitrary JSON for task kinds the core has no type for.
    Json { body: serde_json::Value },
    /// Opaque bytes.
    Raw {
        content_type: String,
        data: Vec<u8>,
    },
}

impl TaskPayload {
    pub fn json(body: serde_json::Value) -> Self {
        TaskPayload::Json { body }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::DocumentIngest(_) => "document_ingest",
            TaskPayload::Json { .. } => "json",
            TaskPayload::Raw { .. } => "raw",
        }
    }
}

/// Hash field names of a stored task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum TaskField {
    TaskId,
    Status,
    Priority,
    RetryCount,
    MaxRetries,
    LastError,
    Result,
    WorkerId,
    Payload,
    CreatedAt,
    UpdatedAt,
}

/// Full status record of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub payload: TaskPayload,
    pub priority: i32,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn lane(&self, threshold: i32) -> Lane {
        Lane::for_priority(self.priority, threshold)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Number of processing attempts made so far, counting the first one.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// Client-facing description of the current state.
    pub fn describe(&self) -> String {
        match (self.status, self.last_error.as_deref()) {
            (TaskStatus::DeadLetter, Some(error)) => format!(
                "processing failed after {} attempts: {}",
                self.attempts(),
                error
            ),
            (TaskStatus::DeadLetter, None) => {
                format!("processing failed after {} attempts", self.attempts())
            }
            (TaskStatus::Failed, Some(error)) => format!(
                "attempt {} failed, retrying: {}",
                self.retry_count, error
            ),
            (status, _) => status.to_string(),
        }
    }

    /// Encode as hash fields. Absent optionals are omitted.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>, QueueError> {
        let mut fields = vec![
            (TaskField::TaskId.to_string(), self.task_id.to_string()),
            (TaskField::Status.to_string(), self.status.to_string()),
            (TaskField::Priority.to_string(), self.priority.to_string()),
            (TaskField::RetryCount.to_string(), self.retry_count.to_string()),
            (TaskField::MaxRetries.to_string(), self.max_retries.to_string()),
            (
                TaskField::Payload.to_string(),
                serde_json::to_string(&self.payload)?,
            ),
            (
                TaskField::CreatedAt.to_string(),
                self.created_at.timestamp_millis().to_string(),
            ),
            (
                TaskField::UpdatedAt.to_string(),
                self.updated_at.timestamp_millis().to_string(),
            ),
        ];

        if let Some(error) = &self.last_error {
            fields.push((TaskField::LastError.to_string(), error.clone()));
        }
        if let Some(result) = &self.result {
            fields.push((TaskField::Result.to_string(), serde_json::to_string(result)?));
        }
        if let Some(worker) = &self.worker_id {
            fields.push((TaskField::WorkerId.to_string(), worker.clone()));
        }

        Ok(fields)
    }

    /// Decode from hash fields as returned by `HGETALL`.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, QueueError> {
        let task_id = TaskId::new(required(fields, TaskField::TaskId, "?")?);
        let invalid = |details: String| QueueError::InvalidRecord {
            task_id: task_id.to_string(),
            details,
        };
        let get = |field: TaskField| required(fields, field, task_id.as_str());

        let status = get(TaskField::Status)?
            .parse::<TaskStatus>()
            .map_err(|e| invalid(format!("status: {}", e)))?;
        let priority = get(TaskField::Priority)?
            .parse::<i32>()
            .map_err(|e| invalid(format!("priority: {}", e)))?;
        let retry_count = get(TaskField::RetryCount)?
            .parse::<u32>()
            .map_err(|e| invalid(format!("retry_count: {}", e)))?;
        let max_retries = get(TaskField::MaxRetries)?
            .parse::<u32>()
            .map_err(|e| invalid(format!("max_retries: {}", e)))?;
        let payload = serde_json::from_str(get(TaskField::Payload)?)
            .map_err(|e| invalid(format!("payload: {}", e)))?;
        let created_at = parse_millis(get(TaskField::CreatedAt)?)
            .ok_or_else(|| invalid("created_at".to_string()))?;
        let updated_at = parse_millis(get(TaskField::UpdatedAt)?)
            .ok_or_else(|| invalid("updated_at".to_string()))?;
        let result = match optional(fields, TaskField::Result) {
            Some(raw) => Some(
                serde_json::from_str(raw).map_err(|e| invalid(format!("result: {}", e)))?,
            ),
            None => None,
        };

        Ok(Self {
            payload,
            priority,
            status,
            retry_count,
            max_retries,
            last_error: optional(fields, TaskField::LastError).map(str::to_string),
            result,
            worker_id: optional(fields, TaskField::WorkerId).map(str::to_string),
            created_at,
            updated_at,
            task_id,
        })
    }
}

fn required<'a>(
    fields: &'a HashMap<String, String>,
    field: TaskField,
    task_id: &str,
) -> Result<&'a str, QueueError> {
    fields
        .get(field.as_ref())
        .map(String::as_str)
        .ok_or_else(|| QueueError::InvalidRecord {
            task_id: task_id.to_string(),
            details: format!("missing field '{}'", field),
        })
}

fn optional(fields: &HashMap<String, String>, field: TaskField) -> Option<&str> {
    fields
        .get(field.as_ref())
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

pub(crate) fn parse_millis(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Enqueue request.
///
/// ```rust,ignore
/// let task = NewTask::new(TaskPayload::json(json!({"doc": "a.pdf"})))
///     .with_id("t1")
///     .with_priority(10)
///     .with_max_retries(3);
/// let id = manager.submit(task).await?;
/// ```
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: Option<TaskId>,
    pub payload: TaskPayload,
    pub priority: i32,
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            task_id: None,
            payload,
            priority: 0,
            max_retries: None,
        }
    }

    pub fn with_id(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Materialize a `pending` record.
    pub fn into_task(self, default_max_retries: u32, now: DateTime<Utc>) -> Task {
        Task {
            task_id: self.task_id.unwrap_or_else(TaskId::generate),
            payload: self.payload,
            priority: self.priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            last_error: None,
            result: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Task {
        NewTask::new(TaskPayload::DocumentIngest(DocumentIngest {
            document_id: "doc-1".to_string(),
            source_url: "s3://bucket/a.pdf".to_string(),
            collection: "tenant-a".to_string(),
            callback_url: Some("https://hooks.example.com/ingest".to_string()),
            metadata: None,
        }))
        .with_id("t1")
        .with_priority(7)
        .into_task(3, Utc::now())
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TaskStatus::DeadLetter.to_string(), "dead_letter");
        assert_eq!("processing".parse::<TaskStatus>().unwrap(), TaskStatus::Processing);
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_lane_threshold() {
        assert_eq!(Lane::for_priority(5, 5), Lane::Priority);
        assert_eq!(Lane::for_priority(4, 5), Lane::Normal);
        assert_eq!(Lane::for_priority(-1, 0), Lane::Normal);
        assert_eq!(Lane::Priority.to_string(), "priority");
    }

    #[test]
    fn test_new_task_defaults() {
        let task = NewTask::new(TaskPayload::json(json!({"doc": "a.pdf"}))).into_task(4, Utc::now());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 4);
        assert_eq!(task.priority, 0);
        assert!(!task.task_id.as_str().is_empty());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn test_fields_round_trip_keeps_optionals() {
        let mut task = sample();
        task.status = TaskStatus::Completed;
        task.last_error = Some("timeout".to_string());
        task.result = Some(json!({"chunks": 12}));
        task.worker_id = Some("worker-1".to_string());

        let fields: HashMap<String, String> = task.to_fields().unwrap().into_iter().collect();
        let decoded = Task::from_fields(&fields).unwrap();

        assert_eq!(decoded.task_id, task.task_id);
        assert_eq!(decoded.payload, task.payload);
        assert_eq!(decoded.status, TaskStatus::Completed);
        assert_eq!(decoded.result, Some(json!({"chunks": 12})));
        assert_eq!(decoded.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(
            decoded.created_at.timestamp_millis(),
            task.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_from_fields_rejects_missing_status() {
        let mut fields: HashMap<String, String> = sample().to_fields().unwrap().into_iter().collect();
        fields.remove("status");

        let err = Task::from_fields(&fields).unwrap_err();
        assert!(matches!(err, QueueError::InvalidRecord { .. }));
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn test_payload_is_tagged() {
        let value = serde_json::to_value(TaskPayload::json(json!({"doc": "a.pdf"}))).unwrap();
        assert_eq!(value["kind"], "json");
        assert_eq!(value["body"]["doc"], "a.pdf");
    }

    #[test]
    fn test_describe_dead_letter() {
        let mut task = sample();
        task.status = TaskStatus::DeadLetter;
        task.retry_count = 3;
        task.last_error = Some("embedding service unavailable".to_string());

        assert_eq!(
            task.describe(),
            "processing failed after 4 attempts: embedding service unavailable"
        );
    }
}
