//! Redis implementation of the queue stores.
//!
//! One [`RedisBroker`] implements [`LaneStore`](crate::LaneStore),
//! [`StatusStore`](crate::StatusStore) and
//! [`DeadLetterStore`](crate::DeadLetterStore) over a shared
//! `ConnectionManager`. Key layout lives in [`KeySpace`].

mod dead_letters;
mod lanes;
mod scripts;
mod status;

use crate::config::TtlPolicy;
use crate::keys::KeySpace;
use crate::task::TaskStatus;
use redis::aio::ConnectionManager;
use std::sync::Arc;

/// Redis-backed broker
#[derive(Clone)]
pub struct RedisBroker {
    redis: Arc<ConnectionManager>,
    keys: KeySpace,
    ttl: TtlPolicy,
    scan_count: usize,
}

impl RedisBroker {
    /// Create a new RedisBroker for the queue under `prefix`
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self::from_arc(Arc::new(redis), prefix)
    }

    /// Create from an Arc<ConnectionManager> (for sharing connections)
    pub fn from_arc(redis: Arc<ConnectionManager>, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            keys: KeySpace::new(prefix),
            ttl: TtlPolicy::default(),
            scan_count: 500,
        }
    }

    /// Set the status record TTLs
    pub fn with_ttl(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    fn conn(&self) -> ConnectionManager {
        (*self.redis).clone()
    }

    fn ttl_secs(&self, status: TaskStatus) -> u64 {
        self.ttl.for_status(status).as_secs().max(1)
    }

    fn index_keys(&self) -> Vec<String> {
        TaskStatus::all().map(|s| self.keys.index(s)).collect()
    }
}
