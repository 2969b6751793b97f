//! Processor seam.
//!
//! The queue never knows what a task does; the worker hands each claimed
//! [`Task`] to a [`TaskProcessor`] and records the outcome.

use crate::error::ProcessError;
use crate::task::Task;
use async_trait::async_trait;
use std::future::Future;

/// Trait for task processors.
///
/// # Example
///
/// ```rust,ignore
/// use task_queue::{ProcessError, Task, TaskPayload, TaskProcessor};
///
/// struct EmbedProcessor {
///     client: EmbeddingClient,
/// }
///
/// #[async_trait]
/// impl TaskProcessor for EmbedProcessor {
///     async fn process(&self, task: &Task) -> Result<serde_json::Value, ProcessError> {
///         let TaskPayload::DocumentIngest(doc) = &task.payload else {
///             return Err(ProcessError::permanent("unsupported payload"));
///         };
///         let chunks = self.client.ingest(doc).await.map_err(|e| ProcessError::transient(e.to_string()))?;
///         Ok(json!({ "chunks": chunks }))
///     }
///
///     fn name(&self) -> &'static str {
///         "EmbedProcessor"
///     }
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Process a single task.
    ///
    /// `Ok(result)` completes the task with `result` stored on its record.
    /// `Err` is retried or dead-lettered according to its category.
    async fn process(&self, task: &Task) -> Result<serde_json::Value, ProcessError>;

    /// Get the processor name for logging.
    fn name(&self) -> &'static str;
}

/// Adapts an async closure into a [`TaskProcessor`].
pub struct FnProcessor<F> {
    name: &'static str,
    handler: F,
}

impl<F, Fut> FnProcessor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ProcessError>> + Send,
{
    pub fn new(name: &'static str, handler: F) -> Self {
        Self { name, handler }
    }
}

#[async_trait]
impl<F, Fut> TaskProcessor for FnProcessor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ProcessError>> + Send,
{
    async fn process(&self, task: &Task) -> Result<serde_json::Value, ProcessError> {
        (self.handler)(task.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, TaskPayload};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_processor() {
        let processor = FnProcessor::new("echo", |task: Task| async move {
            match task.payload {
                TaskPayload::Json { body } => Ok(body),
                _ => Err(ProcessError::permanent("unsupported payload")),
            }
        });
        let task = NewTask::new(TaskPayload::json(json!({"doc": "a.pdf"}))).into_task(3, Utc::now());

        assert_eq!(processor.name(), "echo");
        assert_eq!(processor.process(&task).await.unwrap(), json!({"doc": "a.pdf"}));
    }
}
