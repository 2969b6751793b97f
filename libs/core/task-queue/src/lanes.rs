//! Pending lanes and the delayed-retry set.
//!
//! [`LaneStore`] is the storage seam (Redis lists or the in-memory broker);
//! [`TaskQueue`] adds the lane routing and the timed `pop` on top of it.

use crate::error::QueueError;
use crate::task::{Lane, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Storage primitives behind the lanes.
///
/// Implementations must make `try_pop` atomic: concurrent callers never
/// receive the same id from a single push, and a popped id is recorded as in
/// flight in the same step.
#[async_trait]
pub trait LaneStore: Send + Sync {
    /// Append an id to the tail of a lane. No dedup.
    async fn push(&self, task_id: &TaskId, lane: Lane) -> Result<(), QueueError>;

    /// Remove and return the head id, draining the priority lane first. The
    /// id stays in flight until [`settle`](Self::settle).
    async fn try_pop(&self) -> Result<Option<TaskId>, QueueError>;

    /// Clear the in-flight marker of a popped id.
    async fn settle(&self, task_id: &TaskId) -> Result<bool, QueueError>;

    /// In-flight ids popped at or before `popped_before`, oldest first.
    async fn unsettled(
        &self,
        popped_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError>;

    async fn is_in_flight(&self, task_id: &TaskId) -> Result<bool, QueueError>;

    /// Park an id in the delayed set until `ready_at`.
    async fn schedule(
        &self,
        task_id: &TaskId,
        priority: i32,
        ready_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Move every delayed id due at `now` onto its lane, returning the moved ids.
    async fn promote_due(
        &self,
        now: DateTime<Utc>,
        threshold: i32,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError>;

    async fn len(&self, lane: Lane) -> Result<u64, QueueError>;

    async fn scheduled_len(&self) -> Result<u64, QueueError>;

    /// Whether the id sits in either lane or in the delayed set.
    async fn contains(&self, task_id: &TaskId, priority: i32) -> Result<bool, QueueError>;

    /// Drop every occurrence of the id from lanes and delayed set.
    async fn remove(&self, task_id: &TaskId, priority: i32) -> Result<u64, QueueError>;

    /// Empty both lanes, the delayed set and the in-flight markers.
    async fn clear(&self) -> Result<u64, QueueError>;

    /// Broker liveness check.
    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Two-lane FIFO queue of pending task ids.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn LaneStore>,
    threshold: i32,
    poll_interval: Duration,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn LaneStore>, threshold: i32, poll_interval: Duration) -> Self {
        Self {
            store,
            threshold,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn lane_for(&self, priority: i32) -> Lane {
        Lane::for_priority(priority, self.threshold)
    }

    /// Push onto the lane matching `priority`.
    pub async fn push(&self, task_id: &TaskId, priority: i32) -> Result<Lane, QueueError> {
        let lane = self.lane_for(priority);
        self.store.push(task_id, lane).await?;
        Ok(lane)
    }

    /// Push onto an explicit lane, ignoring priority.
    pub async fn push_to(&self, task_id: &TaskId, lane: Lane) -> Result<(), QueueError> {
        self.store.push(task_id, lane).await
    }

    pub async fn try_pop(&self) -> Result<Option<TaskId>, QueueError> {
        self.store.try_pop().await
    }

    pub async fn settle(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        self.store.settle(task_id).await
    }

    pub async fn unsettled(
        &self,
        popped_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError> {
        self.store.unsettled(popped_before, limit).await
    }

    pub async fn is_in_flight(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        self.store.is_in_flight(task_id).await
    }

    /// Wait up to `timeout` for an id. `None` means the lanes stayed empty.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<TaskId>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(task_id) = self.store.try_pop().await? {
                return Ok(Some(task_id));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn schedule(
        &self,
        task_id: &TaskId,
        priority: i32,
        ready_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.store.schedule(task_id, priority, ready_at).await
    }

    pub async fn promote_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError> {
        self.store.promote_due(now, self.threshold, limit).await
    }

    pub async fn len(&self, lane: Lane) -> Result<u64, QueueError> {
        self.store.len(lane).await
    }

    pub async fn scheduled_len(&self) -> Result<u64, QueueError> {
        self.store.scheduled_len().await
    }

    pub async fn contains(&self, task_id: &TaskId, priority: i32) -> Result<bool, QueueError> {
        self.store.contains(task_id, priority).await
    }

    pub async fn remove(&self, task_id: &TaskId, priority: i32) -> Result<u64, QueueError> {
        self.store.remove(task_id, priority).await
    }

    pub async fn clear(&self) -> Result<u64, QueueError> {
        self.store.clear().await
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        self.store.ping().await
    }
}
