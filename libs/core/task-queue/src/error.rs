//! Queue error types and failure categorization
//!
//! Two families of errors live here:
//! - [`QueueError`]: broker, codec and lifecycle errors raised by the queue itself
//! - [`ProcessError`]: failures reported by a [`TaskProcessor`](crate::TaskProcessor),
//!   categorized to decide between retry and dead-lettering:
//!   - **Transient**: temporary failure, retry with exponential backoff
//!   - **Permanent**: unrecoverable, dead-letter immediately

use crate::task::{TaskId, TaskStatus};
use thiserror::Error;

/// Category of a processing failure for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - retry while the task has budget left
    Transient,
    /// Unrecoverable error - move to the dead letter store immediately
    Permanent,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        *self == ErrorCategory::Transient
    }
}

/// Failure reported by a task processor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessError {
    pub message: String,
    pub category: ErrorCategory,
}

impl ProcessError {
    /// Create a transient processing error
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Create a permanent processing error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No status record exists for the task
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// A task with the same id was already submitted
    #[error("Task already exists: {0}")]
    Duplicate(TaskId),

    /// `retry` was called for a task that is not dead-lettered
    #[error("Task {task_id} is {status}, only dead-lettered tasks can be retried")]
    NotDeadLettered { task_id: TaskId, status: TaskStatus },

    /// A stored record could not be decoded
    #[error("Invalid record for task {task_id}: {details}")]
    InvalidRecord { task_id: String, details: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Whether the error came from a lost or refused broker connection.
    ///
    /// Callers use this to back off and retry instead of giving up.
    pub fn is_connection_error(&self) -> bool {
        match self {
            QueueError::Redis(e) => {
                e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_io_error()
                    || e.is_timeout()
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<core_config::ConfigError> for QueueError {
    fn from(err: core_config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_error_categories() {
        let transient = ProcessError::transient("upstream timeout");
        assert!(transient.is_retryable());
        assert_eq!(transient.to_string(), "upstream timeout");

        let permanent = ProcessError::permanent("unsupported document type");
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.category, ErrorCategory::Permanent);
    }

    #[test]
    fn test_not_dead_lettered_message() {
        let err = QueueError::NotDeadLettered {
            task_id: TaskId::new("t1"),
            status: TaskStatus::Completed,
        };
        assert_eq!(
            err.to_string(),
            "Task t1 is completed, only dead-lettered tasks can be retried"
        );
    }

    #[test]
    fn test_connection_errors() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(QueueError::from(io).is_connection_error());
        assert!(!QueueError::NotFound(TaskId::new("t1")).is_connection_error());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: QueueError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
