use super::RedisBroker;
use super::scripts::{POP_IN_FLIGHT, PROMOTE_DUE};
use crate::error::QueueError;
use crate::keys::{delayed_member, parse_delayed_member};
use crate::lanes::LaneStore;
use crate::task::{Lane, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

#[async_trait]
impl LaneStore for RedisBroker {
    async fn push(&self, task_id: &TaskId, lane: Lane) -> Result<(), QueueError> {
        let mut conn = self.conn();

        let _: i64 = redis::cmd("RPUSH")
            .arg(self.keys.lane(lane))
            .arg(task_id.as_str())
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<TaskId>, QueueError> {
        let mut conn = self.conn();

        let popped: Option<String> = POP_IN_FLIGHT
            .key(self.keys.lane(Lane::Priority))
            .key(self.keys.lane(Lane::Normal))
            .key(self.keys.in_flight())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(popped.map(TaskId::new))
    }

    async fn settle(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.keys.in_flight())
            .arg(task_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn unsettled(
        &self,
        popped_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut conn = self.conn();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.in_flight())
            .arg("-inf")
            .arg(popped_before.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(ids.into_iter().map(TaskId::new).collect())
    }

    async fn is_in_flight(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(self.keys.in_flight())
            .arg(task_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(score.is_some())
    }

    async fn schedule(
        &self,
        task_id: &TaskId,
        priority: i32,
        ready_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn();

        let _: i64 = redis::cmd("ZADD")
            .arg(self.keys.delayed())
            .arg(ready_at.timestamp_millis())
            .arg(delayed_member(task_id, priority))
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn promote_due(
        &self,
        now: DateTime<Utc>,
        threshold: i32,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut conn = self.conn();

        let members: Vec<String> = PROMOTE_DUE
            .key(self.keys.delayed())
            .key(self.keys.lane(Lane::Priority))
            .key(self.keys.lane(Lane::Normal))
            .arg(now.timestamp_millis())
            .arg(threshold)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        let mut promoted = Vec::with_capacity(members.len());
        for member in members {
            match parse_delayed_member(&member) {
                Some((task_id, _)) => promoted.push(task_id),
                None => warn!(member = %member, "Dropped malformed delayed entry"),
            }
        }

        if !promoted.is_empty() {
            debug!(count = promoted.len(), "Promoted due retries");
        }

        Ok(promoted)
    }

    async fn len(&self, lane: Lane) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let len: u64 = redis::cmd("LLEN")
            .arg(self.keys.lane(lane))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn scheduled_len(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let len: u64 = redis::cmd("ZCARD")
            .arg(self.keys.delayed())
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn contains(&self, task_id: &TaskId, priority: i32) -> Result<bool, QueueError> {
        let mut conn = self.conn();

        let (in_priority, in_normal, delayed): (Option<i64>, Option<i64>, Option<f64>) =
            redis::pipe()
                .cmd("LPOS")
                .arg(self.keys.lane(Lane::Priority))
                .arg(task_id.as_str())
                .cmd("LPOS")
                .arg(self.keys.lane(Lane::Normal))
                .arg(task_id.as_str())
                .cmd("ZSCORE")
                .arg(self.keys.delayed())
                .arg(delayed_member(task_id, priority))
                .query_async(&mut conn)
                .await?;

        Ok(in_priority.is_some() || in_normal.is_some() || delayed.is_some())
    }

    async fn remove(&self, task_id: &TaskId, priority: i32) -> Result<u64, QueueError> {
        let mut conn = self.conn();

        let (priority_removed, normal_removed, delayed_removed): (u64, u64, u64) = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.keys.lane(Lane::Priority))
            .arg(0)
            .arg(task_id.as_str())
            .cmd("LREM")
            .arg(self.keys.lane(Lane::Normal))
            .arg(0)
            .arg(task_id.as_str())
            .cmd("ZREM")
            .arg(self.keys.delayed())
            .arg(delayed_member(task_id, priority))
            .query_async(&mut conn)
            .await?;

        Ok(priority_removed + normal_removed + delayed_removed)
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn();

        let (priority, normal, delayed, in_flight, _deleted): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .atomic()
                .cmd("LLEN")
                .arg(self.keys.lane(Lane::Priority))
                .cmd("LLEN")
                .arg(self.keys.lane(Lane::Normal))
                .cmd("ZCARD")
                .arg(self.keys.delayed())
                .cmd("ZCARD")
                .arg(self.keys.in_flight())
                .cmd("DEL")
                .arg(self.keys.lane(Lane::Priority))
                .arg(self.keys.lane(Lane::Normal))
                .arg(self.keys.delayed())
                .arg(self.keys.in_flight())
                .query_async(&mut conn)
                .await?;

        Ok(priority + normal + delayed + in_flight)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
