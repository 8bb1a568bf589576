//! In-memory [`Broker`] double used by unit tests across the crate.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Broker, BrokerError, BrokerSubscription};

struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    counters: HashMap<String, i64>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// A single-process, in-memory stand-in for the broker. Blocking pop is
/// implemented by polling, which is fine at test scale and keeps this free
/// of a second threading model.
pub struct FakeBroker {
    inner: Mutex<Inner>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                hashes: HashMap::new(),
                strings: HashMap::new(),
                lists: HashMap::new(),
                counters: HashMap::new(),
                channels: HashMap::new(),
            }),
        }
    }

    fn channel(inner: &mut Inner, name: &str) -> broadcast::Sender<String> {
        inner
            .channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, BrokerError> {
        Ok(self.inner.lock().unwrap().hashes.get(key).cloned())
    }

    async fn hash_set_fields(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        _ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), BrokerError> {
        self.inner
            .lock()
            .unwrap()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.inner.lock().unwrap().strings.get(key).cloned())
    }

    async fn left_push(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        self.inner
            .lock()
            .unwrap()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn blocking_right_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(list) = inner.lists.get_mut(key) {
                    if let Some(v) = list.pop_back() {
                        return Ok(Some(v));
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let tx = Self::channel(&mut self.inner.lock().unwrap(), channel);
        // No subscribers is not an error (same semantics as broadcast::Sender).
        let _ = tx.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, BrokerError> {
        let tx = Self::channel(&mut self.inner.lock().unwrap(), channel);
        let rx = tx.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(|item| futures::future::ready(item.ok()));
        Ok(Box::pin(stream))
    }

    async fn incr_with_ttl(&self, key: &str, _ttl: Duration) -> Result<i64, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.hashes.remove(key);
        inner.strings.remove(key);
        inner.lists.remove(key);
        inner.counters.remove(key);
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hashes
            .keys()
            .chain(inner.strings.keys())
            .chain(inner.lists.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn llen_many(&self, keys: &[String]) -> Result<Vec<i64>, BrokerError> {
        let inner = self.inner.lock().unwrap();
        Ok(keys
            .iter()
            .map(|k| inner.lists.get(k).map(|l| l.len() as i64).unwrap_or(0))
            .collect())
    }

    async fn push_and_trim(&self, key: &str, value: &str, max_len: isize) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        list.truncate(max_len.max(0) as usize);
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
