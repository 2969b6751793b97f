use super::RedisBroker;
use crate::dlq::{DeadLetterEntry, DeadLetterStore};
use crate::error::QueueError;
use crate::task::TaskId;
use async_trait::async_trait;
use tracing::{debug, info, warn};

#[async_trait]
impl DeadLetterStore for RedisBroker {
    async fn add(&self, entry: &DeadLetterEntry) -> Result<(), QueueError> {
        let data = serde_json::to_string(entry)?;
        let mut conn = self.conn();

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.keys.dead_letters())
            .arg(entry.task_id().as_str())
            .arg(&data)
            .ignore()
            .cmd("ZADD")
            .arg(self.keys.dead_letter_order())
            .arg(entry.failed_at.timestamp_millis())
            .arg(entry.task_id().as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(task_id = %entry.task_id(), "Stored dead letter entry");

        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<DeadLetterEntry>, QueueError> {
        let mut conn = self.conn();

        let data: Option<String> = redis::cmd("HGET")
            .arg(self.keys.dead_letters())
            .arg(task_id.as_str())
            .query_async(&mut conn)
            .await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut conn = self.conn();

        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.keys.dead_letter_order())
            .arg(offset)
            .arg(offset + limit - 1)
            .query_async(&mut conn)
            .await?;

        if ids.is_empty() {
            return Ok(vec![]);
        }

        let payloads: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.keys.dead_letters())
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(payloads.len());
        for (id, data) in ids.iter().zip(payloads) {
            let Some(data) = data else {
                continue;
            };
            match serde_json::from_str::<DeadLetterEntry>(&data) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(task_id = %id, error = %e, "Skipping undecodable dead letter entry"),
            }
        }

        Ok(entries)
    }

    async fn remove(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let mut conn = self.conn();

        let (deleted, _unordered): (u64, u64) = redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.keys.dead_letters())
            .arg(task_id.as_str())
            .cmd("ZREM")
            .arg(self.keys.dead_letter_order())
            .arg(task_id.as_str())
            .query_async(&mut conn)
            .await?;

        Ok(deleted > 0)
    }

    async fn len(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let len: u64 = redis::cmd("HLEN")
            .arg(self.keys.dead_letters())
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn();

        let (len, _deleted): (u64, u64) = redis::pipe()
            .atomic()
            .cmd("HLEN")
            .arg(self.keys.dead_letters())
            .cmd("DEL")
            .arg(self.keys.dead_letters())
            .arg(self.keys.dead_letter_order())
            .query_async(&mut conn)
            .await?;

        if len > 0 {
            info!(count = len, "Purged dead letter store");
        }

        Ok(len)
    }
}
