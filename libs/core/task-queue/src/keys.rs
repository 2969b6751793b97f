//! Redis key layout of one queue.

use crate::task::{Lane, TaskId, TaskStatus};

/// Builds every key of a queue from its prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches(':').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}:lane:{priority|normal}`
    pub fn lane(&self, lane: Lane) -> String {
        format!("{}:lane:{}", self.prefix, lane)
    }

    /// `{prefix}:delayed`
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    /// `{prefix}:inflight`: popped ids not yet claimed, scored by pop time.
    pub fn in_flight(&self) -> String {
        format!("{}:inflight", self.prefix)
    }

    /// `{prefix}:task:{task_id}`
    pub fn task(&self, task_id: &TaskId) -> String {
        format!("{}:task:{}", self.prefix, task_id)
    }

    /// Pattern matching every task hash.
    pub fn task_pattern(&self) -> String {
        format!("{}:task:*", self.prefix)
    }

    /// `{prefix}:index:{status}`
    pub fn index(&self, status: TaskStatus) -> String {
        format!("{}:index:{}", self.prefix, status)
    }

    /// `{prefix}:dead_letter`
    pub fn dead_letters(&self) -> String {
        format!("{}:dead_letter", self.prefix)
    }

    /// `{prefix}:dead_letter:order`
    pub fn dead_letter_order(&self) -> String {
        format!("{}:dead_letter:order", self.prefix)
    }

    /// `{prefix}:events`
    pub fn events(&self) -> String {
        format!("{}:events", self.prefix)
    }
}

/// Member of the delayed set: `{task_id}|{priority}`.
pub fn delayed_member(task_id: &TaskId, priority: i32) -> String {
    format!("{}|{}", task_id, priority)
}

/// Split a delayed-set member back into id and priority.
pub fn parse_delayed_member(member: &str) -> Option<(TaskId, i32)> {
    let (id, priority) = member.rsplit_once('|')?;
    Some((TaskId::new(id), priority.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("ingest:queue:");
        let id = TaskId::new("t1");

        assert_eq!(keys.prefix(), "ingest:queue");
        assert_eq!(keys.lane(Lane::Priority), "ingest:queue:lane:priority");
        assert_eq!(keys.lane(Lane::Normal), "ingest:queue:lane:normal");
        assert_eq!(keys.task(&id), "ingest:queue:task:t1");
        assert_eq!(keys.in_flight(), "ingest:queue:inflight");
        assert_eq!(keys.index(TaskStatus::DeadLetter), "ingest:queue:index:dead_letter");
        assert_eq!(keys.dead_letter_order(), "ingest:queue:dead_letter:order");
        assert_eq!(keys.task_pattern(), "ingest:queue:task:*");
    }

    #[test]
    fn test_delayed_member_keeps_pipes_in_ids() {
        let id = TaskId::new("tenant|doc-9");
        let member = delayed_member(&id, -3);

        assert_eq!(member, "tenant|doc-9|-3");
        assert_eq!(parse_delayed_member(&member), Some((id, -3)));
        assert_eq!(parse_delayed_member("no-priority"), None);
    }
}
