//! Queue operator commands.
//!
//! Every command returns a JSON value that `main` prints, so the same code
//! runs against Redis in production and the in-memory broker in tests.

use clap::{Parser, Subcommand};
use core_config::Environment;
use eyre::{Result, WrapErr, bail, eyre};
use serde_json::{Value, json};
use std::time::Duration;
use task_queue::{DocumentIngest, NewTask, QueueManager, TaskId, TaskPayload};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "Inspect and operate the ingestion task queue")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show queue depths per state
    Stats,

    /// Show the record of one task
    Status {
        /// Task id
        id: String,
    },

    /// Move a dead-lettered task back to pending with a fresh retry budget
    Retry {
        /// Task id
        id: String,
    },

    /// Delete completed and dead-lettered records older than a threshold
    Cleanup {
        /// Age threshold in hours
        #[arg(long, default_value_t = 24)]
        older_than: u64,

        /// Keep going until no batch comes back full
        #[arg(long)]
        all: bool,
    },

    /// Delete every lane entry, record and dead letter of the queue
    Flush {
        /// Confirm the flush
        #[arg(long)]
        yes: bool,
    },

    /// List dead letter entries, oldest first
    DeadLetters {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },

    /// Enqueue a task
    Enqueue {
        /// JSON payload
        payload: String,

        /// Treat the payload as a document ingest request
        #[arg(long)]
        document: bool,

        #[arg(short, long, default_value_t = 0)]
        priority: i32,

        #[arg(long)]
        max_retries: Option<u32>,

        /// Explicit task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Run one reclaim sweep
    Reap {
        /// Override the stale threshold, in seconds
        #[arg(long)]
        stale_after: Option<u64>,
    },
}

/// Run one command against `manager`.
pub async fn execute(
    manager: &QueueManager,
    command: Commands,
    environment: &Environment,
) -> Result<Value> {
    match command {
        Commands::Stats => Ok(serde_json::to_value(manager.stats().await?)?),

        Commands::Status { id } => {
            let task_id = TaskId::new(id);
            let task = manager
                .get_status(&task_id)
                .await?
                .ok_or_else(|| eyre!("Task {} not found", task_id))?;

            let mut value = serde_json::to_value(&task)?;
            value["summary"] = Value::String(task.describe());
            Ok(value)
        }

        Commands::Retry { id } => {
            let task = manager
                .retry(&TaskId::new(id))
                .await
                .wrap_err("Retry failed")?;
            info!(task_id = %task.task_id, "Task requeued");
            Ok(json!({ "task_id": task.task_id, "status": task.status }))
        }

        Commands::Cleanup { older_than, all } => {
            let age = Duration::from_secs(older_than.saturating_mul(3600));
            let mut completed = 0;
            let mut dead_letter = 0;

            loop {
                let report = manager.cleanup(age).await?;
                completed += report.completed;
                dead_letter += report.dead_letter;
                if !all || !report.has_more || report.removed() == 0 {
                    return Ok(json!({
                        "completed": completed,
                        "dead_letter": dead_letter,
                        "has_more": report.has_more,
                    }));
                }
            }
        }

        Commands::Flush { yes } => {
            if environment.is_production() {
                bail!("Refusing to flush the queue in production");
            }
            if !yes {
                bail!("Flush deletes every task of the queue; pass --yes to confirm");
            }
            Ok(serde_json::to_value(manager.flush().await?)?)
        }

        Commands::DeadLetters { limit, offset } => {
            let entries = manager.dead_letters(limit, offset).await?;
            Ok(json!({
                "count": entries.len(),
                "limit": limit,
                "offset": offset,
                "entries": entries,
            }))
        }

        Commands::Enqueue {
            payload,
            document,
            priority,
            max_retries,
            id,
        } => {
            let body: Value = serde_json::from_str(&payload).wrap_err("Payload is not valid JSON")?;
            let payload = if document {
                let doc: DocumentIngest =
                    serde_json::from_value(body).wrap_err("Payload is not a document ingest request")?;
                TaskPayload::DocumentIngest(doc)
            } else {
                TaskPayload::json(body)
            };

            let mut task = NewTask::new(payload).with_priority(priority);
            if let Some(max_retries) = max_retries {
                task = task.with_max_retries(max_retries);
            }
            if let Some(id) = id {
                task = task.with_id(id);
            }

            let task_id = manager.submit(task).await?;
            Ok(json!({ "task_id": task_id }))
        }

        Commands::Reap { stale_after } => {
            let stale_after = stale_after
                .map(Duration::from_secs)
                .unwrap_or(manager.config().stale_after);
            Ok(serde_json::to_value(manager.reclaim_stale(stale_after).await?)?)
        }
    }
}
