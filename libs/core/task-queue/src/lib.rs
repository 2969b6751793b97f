//! Task Queue
//!
//! A Redis-backed task ingestion queue for background document processing.
//!
//! ## Features
//!
//! - **Two lanes**: tasks at or above the priority threshold jump ahead of normal ones
//! - **Status records**: every task has a hash record that tracks its lifecycle
//! - **Retries with backoff**: failed attempts wait in a delayed set, then rejoin their lane
//! - **Dead letter store**: exhausted or non-retryable tasks are kept for inspection and retry
//! - **Reaper**: stale `processing` tasks and orphaned records are returned to their lanes
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use task_queue::{QueueConfig, QueueManager, TaskPayload, Worker, WorkerConfig};
//!
//! let manager = Arc::new(QueueManager::redis(conn, QueueConfig::from_env()?));
//! let id = manager.enqueue(TaskPayload::json(json!({"doc": "a.pdf"})), 5, None).await?;
//!
//! let worker = Worker::new(manager.clone(), processor, WorkerConfig::from_env()?);
//! worker.run(shutdown_rx).await?;
//! ```

mod backoff;
mod config;
pub mod connection;
mod dlq;
mod error;
mod events;
mod health;
mod keys;
mod lanes;
mod manager;
mod memory;
pub mod metrics;
mod processor;
mod redis_backend;
mod status;
mod task;
mod worker;

pub use backoff::{IdleBackoff, RetryPolicy, error_backoff};
pub use config::{QueueConfig, TtlPolicy, WorkerConfig};
pub use connection::{ConnectRetry, connect, connect_with_retry};
pub use dlq::{DeadLetterEntry, DeadLetterStore};
pub use error::{ErrorCategory, ProcessError, QueueError};
pub use events::{EventSink, RedisEventStream, TaskEvent};
pub use health::{HealthState, admin_router, full_admin_router, health_router};
pub use keys::KeySpace;
pub use lanes::{LaneStore, TaskQueue};
pub use manager::{CleanupReport, FailOutcome, FlushReport, QueueManager, QueueStats, ReclaimReport};
pub use memory::MemoryBroker;
pub use metrics::{QueueMetrics, init_metrics};
pub use processor::{FnProcessor, TaskProcessor};
pub use redis_backend::RedisBroker;
pub use status::{Precondition, RetryIncrement, StatusStore, StatusUpdate};
pub use task::{DocumentIngest, Lane, NewTask, Task, TaskId, TaskPayload, TaskStatus};
pub use worker::Worker;
