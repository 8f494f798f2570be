//! Shared test utilities for domain testing
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: Deterministic test data generation (always available)
//!
//! # Usage
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_redis_test");
//!
//!     let conn = redis.connection_manager().await;
//!     let prefix = builder.key_prefix();
//! }
//! ```

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// The same test name always yields the same ids, recipients and key prefix,
/// while different tests never collide on a shared Redis.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (seed is the hash of the name)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_submit_job");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// A job id unique to this test.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.job_id("main"), "test-job-7-main");
    /// ```
    pub fn job_id(&self, suffix: &str) -> String {
        format!("test-job-{}-{}", self.seed, suffix)
    }

    /// `count` distinct recipient addresses.
    pub fn recipients(&self, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| format!("user{}-{}@example.test", i, self.seed))
            .collect()
    }

    /// A Redis key prefix isolating this test's keys.
    pub fn key_prefix(&self) -> String {
        format!("test:{}", self.seed)
    }
}
