//! Shared test utilities for the queue crates
//!
//! - `TestRedis`: Redis container with automatic cleanup
//! - `TestDataBuilder`: deterministic key prefixes and task ids per test
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_redis_test");
//!
//!     let manager = QueueManager::redis(redis.connection(), QueueConfig::new(builder.key_prefix()));
//! }
//! ```

mod redis;

pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// Tests sharing a Redis instance stay isolated by using a prefix derived
/// from their name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_enqueue_dequeue");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Queue key prefix unique to this builder.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.key_prefix(), "test:7:queue");
    /// ```
    pub fn key_prefix(&self) -> String {
        format!("test:{}:queue", self.seed)
    }

    /// Deterministic task id, e.g. `test-12345-doc-1`.
    pub fn task_id(&self, suffix: &str) -> String {
        format!("test-{}-{}", self.seed, suffix)
    }

    /// Worker id that never collides across tests.
    pub fn worker_id(&self) -> String {
        format!("worker-{}-{}", self.seed, uuid::Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.key_prefix(), builder2.key_prefix());
        assert_eq!(builder1.task_id("doc"), builder2.task_id("doc"));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.key_prefix(), builder2.key_prefix());
    }

    #[test]
    fn test_worker_ids_are_unique() {
        let builder = TestDataBuilder::new(1);
        assert_ne!(builder.worker_id(), builder.worker_id());
    }
}
