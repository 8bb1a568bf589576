//! Redis-backed [`Broker`] implementation.
//!
//! Redis's data model (hashes, lists with blocking pop, pub/sub, `INCR` +
//! `EXPIRE`, pipelines) covers the broker contract directly. We use the
//! `tokio-comp` + `connection-manager` features so a single shared handle
//! reconnects transparently under the hood.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{Broker, BrokerError, BrokerSubscription};

/// Maximum retry attempts for a transient broker operation.
const MAX_RETRIES: u32 = 5;

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(16))
}

pub struct RedisBroker {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::Unavailable(format!("invalid broker url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("initial connection failed: {e}")))?;
        Ok(Self { manager, client })
    }

    /// Runs `op` against a fresh clone of the connection manager, retrying
    /// transient failures with exponential backoff (2s, 4s, 8s, 16s, 16s)
    /// before surfacing `BrokerError::Unavailable`.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, BrokerError>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            match op(self.manager.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_connection_dropped() || e.is_timeout() || e.is_io_error() => {
                    tracing::warn!(attempt, error = %e, "transient broker error, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(BrokerError::Transient(e.to_string())),
            }
        }
        Err(BrokerError::Unavailable(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, BrokerError> {
        let key = key.to_string();
        let map: HashMap<String, String> = self
            .with_retry(|mut c| {
                let key = key.clone();
                async move { c.hgetall(&key).await }
            })
            .await?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn hash_set_fields(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let key = key.to_string();
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.with_retry(|mut c| {
            let key = key.clone();
            let fields = fields.clone();
            async move {
                let mut pipe = redis::pipe();
                pipe.hset_multiple(&key, &fields).ignore();
                if let Some(ttl) = ttl {
                    pipe.expire(&key, ttl.as_secs() as i64).ignore();
                }
                pipe.query_async::<()>(&mut c).await
            }
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            let value = value.clone();
            async move { c.set_ex::<_, _, ()>(&key, &value, ttl.as_secs()).await }
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.get(&key).await }
        })
        .await
    }

    async fn left_push(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            let value = value.clone();
            async move { c.lpush::<_, _, ()>(&key, &value).await }
        })
        .await
    }

    async fn blocking_right_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        let key = key.to_string();
        let result: Option<(String, String)> = self
            .with_retry(|mut c| {
                let key = key.clone();
                async move { c.brpop(&key, timeout.as_secs_f64()).await }
            })
            .await?;
        Ok(result.map(|(_, value)| value))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let channel = channel.to_string();
        let payload = payload.to_string();
        self.with_retry(|mut c| {
            let channel = channel.clone();
            let payload = payload.clone();
            async move { c.publish::<_, _, ()>(&channel, &payload).await }
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Box::pin(stream) as Pin<Box<dyn futures::Stream<Item = String> + Send>>)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, BrokerError> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.cmd("INCR").arg(&key);
                pipe.cmd("EXPIRE").arg(&key).arg(ttl.as_secs() as i64).arg("NX").ignore();
                let (count,): (i64,) = pipe.query_async(&mut c).await?;
                Ok(count)
            }
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.expire::<_, ()>(&key, ttl.as_secs() as i64).await }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.del::<_, ()>(&key).await }
        })
        .await
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let pattern = format!("{prefix}*");
        self.with_retry(|mut c| {
            let pattern = pattern.clone();
            async move { c.keys(&pattern).await }
        })
        .await
    }

    async fn llen_many(&self, keys: &[String]) -> Result<Vec<i64>, BrokerError> {
        let keys = keys.to_vec();
        self.with_retry(|mut c| {
            let keys = keys.clone();
            async move {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.llen(key);
                }
                pipe.query_async(&mut c).await
            }
        })
        .await
    }

    async fn push_and_trim(&self, key: &str, value: &str, max_len: isize) -> Result<(), BrokerError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            let value = value.clone();
            async move {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.lpush(&key, &value).ignore();
                pipe.ltrim(&key, 0, max_len - 1).ignore();
                pipe.query_async::<()>(&mut c).await
            }
        })
        .await
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.with_retry(|mut c| async move { redis::cmd("PING").query_async::<()>(&mut c).await })
            .await
    }
}
