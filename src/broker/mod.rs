//! Broker Adapter: typed operations over the shared key-value + pub/sub
//! store. The broker is the only cross-process coordination point in the
//! system — no component holds job state in memory across a suspension.
//!
//! [`Broker`] is implemented by [`redis_backend::RedisBroker`] in production
//! and by [`fake::FakeBroker`] in tests, so the Job Store, Admission
//! Gateway, Submission/Result services, and Worker Loop can all be exercised
//! without a running broker process.

mod error;
mod fake;
mod redis_backend;

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

pub use error::BrokerError;
pub use fake::FakeBroker;
pub use redis_backend::RedisBroker;

/// A live pub/sub subscription; yields message payloads as they arrive.
pub type BrokerSubscription = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Typed operations over the shared broker.
///
/// Implementations retry transient transport errors with bounded backoff
/// internally and only surface [`BrokerError::Unavailable`] once retries are
/// exhausted.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Read every field of a hash, or `None` if the key doesn't exist.
    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, BrokerError>;

    /// Set one or more fields of a hash in a single round-trip, optionally
    /// (re)setting the key's TTL.
    async fn hash_set_fields(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError>;

    /// `SET key value EX ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Plain `GET`.
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Push a value onto the left end of a list (producer side of a queue).
    async fn left_push(&self, key: &str, value: &str) -> Result<(), BrokerError>;

    /// Atomically pop from the right end of a list, blocking up to
    /// `timeout`. Returns `None` on timeout. A given element is handed to
    /// exactly one caller, even with several concurrent pollers.
    async fn blocking_right_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError>;

    /// Publish a message on a pub/sub channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Subscribe to a pub/sub channel.
    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, BrokerError>;

    /// Atomically increment a counter, setting a TTL only the first time the
    /// key is created. Backs fixed-window rate-limit counters.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, BrokerError>;

    /// Set (or refresh) a key's expiry.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;

    /// List keys matching a prefix (used for diagnostics/cache maintenance,
    /// never on a request hot path).
    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError>;

    /// Pipelined `LLEN` over several queues at once, for the autoscaler's
    /// pull-path sweep.
    async fn llen_many(&self, keys: &[String]) -> Result<Vec<i64>, BrokerError>;

    /// Trim a list to its most recent `max_len` entries.
    async fn push_and_trim(&self, key: &str, value: &str, max_len: isize) -> Result<(), BrokerError>;

    /// Liveness check used by health endpoints and the autoscaler's
    /// subscription-health sweep.
    async fn ping(&self) -> Result<(), BrokerError>;
}
