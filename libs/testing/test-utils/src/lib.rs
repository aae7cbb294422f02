//! Container-backed brokers for integration tests.
//!
//! - `TestNats`: NATS with JetStream (feature: "nats")
//! - `TestRedis`: Redis (feature: "redis")
//! - `TestRabbitMq`: RabbitMQ (feature: "rabbitmq")
//! - `TestNames`: deterministic, per-test stream/queue names (always available)
//!
//! Containers are removed when the wrapper is dropped. Tests using them need
//! a Docker daemon, so they are usually marked `#[ignore]`:
//!
//! ```rust,ignore
//! use test_utils::TestNats;
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn publishes_to_stream() {
//!     let nats = TestNats::new().await;
//!     let config = NatsConfig::new(nats.host(), nats.port());
//! }
//! ```

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "nats")]
pub use nats::TestNats;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Deterministic names derived from the test name, so parallel tests sharing
/// one broker do not collide.
pub struct TestNames {
    seed: u64,
}

impl TestNames {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Stream names must be upper-case-safe and contain no dots.
    pub fn stream(&self, prefix: &str) -> String {
        format!("{}_{}", prefix.to_uppercase(), self.seed)
    }

    /// Dotted subject under a per-test namespace.
    pub fn subject(&self, prefix: &str, suffix: &str) -> String {
        format!("{}.{}.{}", prefix, self.seed, suffix)
    }

    pub fn queue(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.seed)
    }

    /// A fresh unique identifier, not derived from the seed.
    pub fn unique(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_deterministic() {
        let a = TestNames::from_test_name("orders");
        let b = TestNames::from_test_name("orders");
        assert_eq!(a.stream("orders"), b.stream("orders"));
        assert_eq!(a.subject("orders", "created"), b.subject("orders", "created"));
    }

    #[test]
    fn test_names_differ_per_test() {
        let a = TestNames::from_test_name("first");
        let b = TestNames::from_test_name("second");
        assert_ne!(a.queue("jobs"), b.queue("jobs"));
        assert!(!a.stream("orders").contains('.'));
    }
}
