//! In-process broker for tests and local runs.
//!
//! One [`MemoryBroker`] implements all three stores over a single mutex, so
//! every operation is atomic the same way the Redis scripts are. TTLs are
//! enforced lazily on access.

use crate::config::TtlPolicy;
use crate::dlq::{DeadLetterEntry, DeadLetterStore};
use crate::error::QueueError;
use crate::lanes::LaneStore;
use crate::status::{Precondition, RetryIncrement, StatusStore, StatusUpdate};
use crate::task::{Lane, Task, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct StoredTask {
    task: Task,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    priority: VecDeque<TaskId>,
    normal: VecDeque<TaskId>,
    delayed: HashMap<(TaskId, i32), DateTime<Utc>>,
    in_flight: HashMap<TaskId, DateTime<Utc>>,
    tasks: HashMap<TaskId, StoredTask>,
    dead_letters: HashMap<TaskId, DeadLetterEntry>,
}

impl State {
    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<TaskId> {
        match lane {
            Lane::Priority => &mut self.priority,
            Lane::Normal => &mut self.normal,
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.tasks.retain(|_, stored| stored.expires_at > now);
    }
}

/// Shared in-memory implementation of [`LaneStore`], [`StatusStore`] and
/// [`DeadLetterStore`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    ttl: TtlPolicy,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // No mutation spans a panic point; poisoning carries no information.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expiry(&self, status: TaskStatus, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl.for_status(status))
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl LaneStore for MemoryBroker {
    async fn push(&self, task_id: &TaskId, lane: Lane) -> Result<(), QueueError> {
        self.lock().lane_mut(lane).push_back(task_id.clone());
        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<TaskId>, QueueError> {
        let mut state = self.lock();
        let popped = Lane::drain_order()
            .into_iter()
            .find_map(|lane| state.lane_mut(lane).pop_front());
        if let Some(task_id) = &popped {
            state.in_flight.insert(task_id.clone(), Utc::now());
        }
        Ok(popped)
    }

    async fn settle(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        Ok(self.lock().in_flight.remove(task_id).is_some())
    }

    async fn unsettled(
        &self,
        popped_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError> {
        let state = self.lock();
        let mut popped: Vec<(&TaskId, &DateTime<Utc>)> = state
            .in_flight
            .iter()
            .filter(|(_, at)| **at <= popped_before)
            .collect();
        popped.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));

        Ok(popped
            .into_iter()
            .take(limit)
            .map(|(task_id, _)| task_id.clone())
            .collect())
    }

    async fn is_in_flight(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        Ok(self.lock().in_flight.contains_key(task_id))
    }

    async fn schedule(
        &self,
        task_id: &TaskId,
        priority: i32,
        ready_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.lock()
            .delayed
            .insert((task_id.clone(), priority), ready_at);
        Ok(())
    }

    async fn promote_due(
        &self,
        now: DateTime<Utc>,
        threshold: i32,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut state = self.lock();

        let mut due: Vec<((TaskId, i32), DateTime<Utc>)> = state
            .delayed
            .iter()
            .filter(|(_, ready_at)| **ready_at <= now)
            .map(|(member, ready_at)| (member.clone(), *ready_at))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        due.truncate(limit);

        let mut moved = Vec::with_capacity(due.len());
        for ((task_id, priority), _) in due {
            state.delayed.remove(&(task_id.clone(), priority));
            state
                .lane_mut(Lane::for_priority(priority, threshold))
                .push_back(task_id.clone());
            moved.push(task_id);
        }

        Ok(moved)
    }

    async fn len(&self, lane: Lane) -> Result<u64, QueueError> {
        Ok(self.lock().lane_mut(lane).len() as u64)
    }

    async fn scheduled_len(&self) -> Result<u64, QueueError> {
        Ok(self.lock().delayed.len() as u64)
    }

    async fn contains(&self, task_id: &TaskId, priority: i32) -> Result<bool, QueueError> {
        let state = self.lock();
        Ok(state.priority.contains(task_id)
            || state.normal.contains(task_id)
            || state.delayed.contains_key(&(task_id.clone(), priority)))
    }

    async fn remove(&self, task_id: &TaskId, priority: i32) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let before = state.priority.len() + state.normal.len();
        state.priority.retain(|id| id != task_id);
        state.normal.retain(|id| id != task_id);
        let mut removed = (before - state.priority.len() - state.normal.len()) as u64;
        if state.delayed.remove(&(task_id.clone(), priority)).is_some() {
            removed += 1;
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let removed = state.priority.len()
            + state.normal.len()
            + state.delayed.len()
            + state.in_flight.len();
        state.priority.clear();
        state.normal.clear();
        state.delayed.clear();
        state.in_flight.clear();
        Ok(removed as u64)
    }
}

#[async_trait]
impl StatusStore for MemoryBroker {
    async fn create(&self, task: &Task) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = self.lock();
        state.purge_expired(now);

        if state.tasks.contains_key(&task.task_id) {
            return Ok(false);
        }
        state.tasks.insert(
            task.task_id.clone(),
            StoredTask {
                task: task.clone(),
                expires_at: self.expiry(task.status, now),
            },
        );
        Ok(true)
    }

    async fn save(&self, task: &Task) -> Result<(), QueueError> {
        let now = Utc::now();
        self.lock().tasks.insert(
            task.task_id.clone(),
            StoredTask {
                task: task.clone(),
                expires_at: self.expiry(task.status, now),
            },
        );
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError> {
        let mut state = self.lock();
        state.purge_expired(Utc::now());
        Ok(state.tasks.get(task_id).map(|stored| stored.task.clone()))
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        guard: &Precondition,
        status: TaskStatus,
        update: &StatusUpdate,
    ) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let expires_at = self.expiry(status, now);
        let mut state = self.lock();
        state.purge_expired(now);

        let Some(stored) = state.tasks.get_mut(task_id) else {
            return Ok(None);
        };
        if !guard.matches(&stored.task) {
            return Ok(None);
        }

        update.apply(&mut stored.task, status, now);
        stored.expires_at = expires_at;
        Ok(Some(stored.task.clone()))
    }

    async fn increment_retry(&self, task_id: &TaskId) -> Result<RetryIncrement, QueueError> {
        let mut state = self.lock();
        state.purge_expired(Utc::now());

        let stored = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.clone()))?;
        let task = &mut stored.task;

        if task.retry_count >= task.max_retries {
            return Ok(RetryIncrement::Exhausted(task.retry_count));
        }
        task.retry_count += 1;
        Ok(RetryIncrement::Incremented(task.retry_count))
    }

    async fn touch(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let now = Utc::now();
        let expires_at = self.expiry(TaskStatus::Processing, now);
        let mut state = self.lock();
        state.purge_expired(now);

        match state.tasks.get_mut(task_id) {
            Some(stored) if stored.task.status == TaskStatus::Processing => {
                stored.task.updated_at = now;
                stored.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count(&self, status: TaskStatus) -> Result<u64, QueueError> {
        let mut state = self.lock();
        state.purge_expired(Utc::now());
        Ok(state
            .tasks
            .values()
            .filter(|stored| stored.task.status == status)
            .count() as u64)
    }

    async fn updated_before_page(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut state = self.lock();
        state.purge_expired(Utc::now());

        let mut matching: Vec<&Task> = state
            .tasks
            .values()
            .map(|stored| &stored.task)
            .filter(|task| task.status == status && task.updated_at <= cutoff)
            .collect();
        matching.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|task| task.task_id.clone())
            .collect())
    }

    async fn remove(&self, task_id: &TaskId, guard: &Precondition) -> Result<bool, QueueError> {
        let mut state = self.lock();
        state.purge_expired(Utc::now());

        let matches = state
            .tasks
            .get(task_id)
            .is_some_and(|stored| guard.matches(&stored.task));
        if matches {
            state.tasks.remove(task_id);
        }
        Ok(matches)
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let removed = state.tasks.len() as u64;
        state.tasks.clear();
        Ok(removed)
    }
}

#[async_trait]
impl DeadLetterStore for MemoryBroker {
    async fn add(&self, entry: &DeadLetterEntry) -> Result<(), QueueError> {
        self.lock()
            .dead_letters
            .insert(entry.task_id().clone(), entry.clone());
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<DeadLetterEntry>, QueueError> {
        Ok(self.lock().dead_letters.get(task_id).cloned())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.lock();
        let mut entries: Vec<&DeadLetterEntry> = state.dead_letters.values().collect();
        entries.sort_by(|a, b| {
            a.failed_at
                .cmp(&b.failed_at)
                .then_with(|| a.task_id().cmp(b.task_id()))
        });

        Ok(entries
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        Ok(self.lock().dead_letters.remove(task_id).is_some())
    }

    async fn len(&self) -> Result<u64, QueueError> {
        Ok(self.lock().dead_letters.len() as u64)
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let removed = state.dead_letters.len() as u64;
        state.dead_letters.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, TaskPayload};
    use serde_json::json;
    use std::time::Duration;

    fn task(id: &str, max_retries: u32) -> Task {
        NewTask::new(TaskPayload::json(json!({"id": id})))
            .with_id(id)
            .with_max_retries(max_retries)
            .into_task(3, Utc::now())
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let broker = MemoryBroker::new();
        assert!(broker.create(&task("t1", 3)).await.unwrap());
        assert!(!broker.create(&task("t1", 3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_guard() {
        let broker = MemoryBroker::new();
        broker.create(&task("t1", 3)).await.unwrap();
        let id = TaskId::new("t1");

        let claimed = broker
            .transition(
                &id,
                &Precondition::status_in(&[TaskStatus::Pending]),
                TaskStatus::Processing,
                &StatusUpdate::new().worker("w1"),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));

        let second = broker
            .transition(
                &id,
                &Precondition::status_in(&[TaskStatus::Pending]),
                TaskStatus::Processing,
                &StatusUpdate::new().worker("w2"),
            )
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_increment_retry_is_bounded() {
        let broker = MemoryBroker::new();
        broker.create(&task("t1", 2)).await.unwrap();
        let id = TaskId::new("t1");

        assert_eq!(broker.increment_retry(&id).await.unwrap(), RetryIncrement::Incremented(1));
        assert_eq!(broker.increment_retry(&id).await.unwrap(), RetryIncrement::Incremented(2));
        assert_eq!(broker.increment_retry(&id).await.unwrap(), RetryIncrement::Exhausted(2));

        let missing = broker.increment_retry(&TaskId::new("nope")).await.unwrap_err();
        assert!(matches!(missing, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_records_expire() {
        let broker = MemoryBroker::new().with_ttl(TtlPolicy {
            active: Duration::from_millis(20),
            terminal: Duration::from_secs(60),
        });
        broker.create(&task("t1", 3)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(StatusStore::get(&broker, &TaskId::new("t1")).await.unwrap().is_none());
        assert_eq!(broker.count(TaskStatus::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_touch_only_processing() {
        let broker = MemoryBroker::new();
        broker.create(&task("t1", 3)).await.unwrap();
        let id = TaskId::new("t1");

        assert!(!broker.touch(&id).await.unwrap());
        broker
            .set_status(&id, TaskStatus::Processing, &StatusUpdate::new())
            .await
            .unwrap();
        assert!(broker.touch(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_dead_letters_listed_oldest_first() {
        let broker = MemoryBroker::new();
        let now = Utc::now();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let entry = DeadLetterEntry::new(
                task(id, 0),
                "boom",
                now + chrono::Duration::seconds(i as i64),
            );
            broker.add(&entry).await.unwrap();
        }

        let page = broker.list(2, 1).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|e| e.task_id().as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(DeadLetterStore::len(&broker).await.unwrap(), 3);
    }
}
