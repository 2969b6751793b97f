use super::RedisBroker;
use super::scripts::{INCREMENT_RETRY, REMOVE_RECORD, TOUCH, TRANSITION, UPSERT_RECORD};
use crate::error::QueueError;
use crate::status::{Precondition, RetryIncrement, StatusStore, StatusUpdate};
use crate::task::{Task, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

impl RedisBroker {
    async fn upsert(&self, task: &Task, mode: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let mut invocation = UPSERT_RECORD.prepare_invoke();

        invocation
            .key(self.keys.task(&task.task_id))
            .key(self.keys.index(task.status));
        for index in self.index_keys() {
            invocation.key(index);
        }

        invocation
            .arg(task.task_id.as_str())
            .arg(task.updated_at.timestamp_millis())
            .arg(self.ttl_secs(task.status))
            .arg(mode);
        for (field, value) in task.to_fields()? {
            invocation.arg(field).arg(value);
        }

        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }
}

fn cutoff_arg(guard: &Precondition) -> String {
    guard
        .updated_before
        .map(|cutoff| cutoff.timestamp_millis().to_string())
        .unwrap_or_default()
}

fn holder_arg(guard: &Precondition) -> &str {
    guard.worker_id.as_deref().unwrap_or_default()
}

#[async_trait]
impl StatusStore for RedisBroker {
    async fn create(&self, task: &Task) -> Result<bool, QueueError> {
        self.upsert(task, "nx").await
    }

    async fn save(&self, task: &Task) -> Result<(), QueueError> {
        self.upsert(task, "replace").await.map(|_| ())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError> {
        let mut conn = self.conn();

        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.task(task_id))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        Task::from_fields(&fields).map(Some)
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        guard: &Precondition,
        status: TaskStatus,
        update: &StatusUpdate,
    ) -> Result<Option<Task>, QueueError> {
        let (set, delete) = update.to_fields(status)?;
        let mut conn = self.conn();
        let mut invocation = TRANSITION.prepare_invoke();

        invocation
            .key(self.keys.task(task_id))
            .key(self.keys.index(status));
        for index in self.index_keys() {
            invocation.key(index);
        }

        invocation
            .arg(task_id.as_str())
            .arg(guard.status_list())
            .arg(cutoff_arg(guard))
            .arg(status.as_ref())
            .arg(Utc::now().timestamp_millis())
            .arg(self.ttl_secs(status))
            .arg(holder_arg(guard))
            .arg(set.len());
        for (field, value) in &set {
            invocation.arg(field.as_ref()).arg(value);
        }
        for field in &delete {
            invocation.arg(field.as_ref());
        }

        let fields: Option<HashMap<String, String>> = invocation.invoke_async(&mut conn).await?;

        match fields {
            Some(fields) => Task::from_fields(&fields).map(Some),
            None => {
                debug!(task_id = %task_id, status = %status, "Status transition skipped");
                Ok(None)
            }
        }
    }

    async fn increment_retry(&self, task_id: &TaskId) -> Result<RetryIncrement, QueueError> {
        let mut conn = self.conn();

        let outcome: Option<(i64, u32)> = INCREMENT_RETRY
            .key(self.keys.task(task_id))
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            Some((1, count)) => Ok(RetryIncrement::Incremented(count)),
            Some((_, count)) => Ok(RetryIncrement::Exhausted(count)),
            None => Err(QueueError::NotFound(task_id.clone())),
        }
    }

    async fn touch(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let mut conn = self.conn();

        let touched: i64 = TOUCH
            .key(self.keys.task(task_id))
            .key(self.keys.index(TaskStatus::Processing))
            .arg(task_id.as_str())
            .arg(Utc::now().timestamp_millis())
            .arg(self.ttl_secs(TaskStatus::Processing))
            .invoke_async(&mut conn)
            .await?;

        Ok(touched == 1)
    }

    async fn count(&self, status: TaskStatus) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let count: u64 = redis::cmd("ZCARD")
            .arg(self.keys.index(status))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn updated_before_page(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut conn = self.conn();

        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.index(status))
            .arg("-inf")
            .arg(cutoff.timestamp_millis())
            .arg("LIMIT")
            .arg(offset)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        Ok(ids.into_iter().map(TaskId::new).collect())
    }

    async fn remove(&self, task_id: &TaskId, guard: &Precondition) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let mut invocation = REMOVE_RECORD.prepare_invoke();

        invocation.key(self.keys.task(task_id));
        for index in self.index_keys() {
            invocation.key(index);
        }
        invocation
            .arg(task_id.as_str())
            .arg(guard.status_list())
            .arg(cutoff_arg(guard))
            .arg(holder_arg(guard));

        let removed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(removed == 1)
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(self.keys.task_pattern())
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let _: u64 = redis::cmd("DEL")
            .arg(self.index_keys())
            .query_async(&mut conn)
            .await?;

        Ok(removed)
    }
}
