//! Fixed-window rate limiting over the broker's atomic increment-with-TTL
//! primitive. Two independent windows are tracked per request: one keyed by
//! client IP (protects against anonymous floods) and one keyed by a
//! truncated HMAC of the API key (protects against a single abusive key
//! hammering the service from many IPs, without storing the key itself in
//! the broker keyspace). Both must pass for a submission to be admitted.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::broker::{Broker, BrokerError};

/// Counters live for two full minutes so a counter created near the end of
/// its minute still has a TTL once the bucket rolls over.
const COUNTER_TTL: Duration = Duration::from_secs(120);
pub const IP_LIMIT: i64 = 15;
pub const KEY_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Limited,
}

pub struct RateLimiter {
    broker: Arc<dyn Broker>,
    hmac_key: Vec<u8>,
}

type HmacSha256 = Hmac<Sha256>;

impl RateLimiter {
    pub fn new(broker: Arc<dyn Broker>, hmac_key: impl Into<Vec<u8>>) -> Self {
        Self {
            broker,
            hmac_key: hmac_key.into(),
        }
    }

    /// Checks and increments the per-IP window for the current minute.
    pub async fn check_ip(&self, ip: &str, now: i64) -> Verdict {
        let minute = now / 60;
        self.check(&format!("ratelimit:ip:{ip}:{minute}"), IP_LIMIT)
            .await
    }

    /// Checks and increments the per-API-key window for the current minute,
    /// keyed by a truncated HMAC of the key rather than the key itself.
    pub async fn check_key(&self, api_key: &str, now: i64) -> Verdict {
        let minute = now / 60;
        let hashed = self.hash_key(api_key);
        self.check(&format!("ratelimit:apikey:{hashed}:{minute}"), KEY_LIMIT)
            .await
    }

    fn hash_key(&self, api_key: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.hmac_key).expect("HMAC accepts a key of any length");
        mac.update(api_key.as_bytes());
        let full = mac.finalize().into_bytes();
        // Truncated to 16 hex chars (8 bytes): enough to avoid collisions
        // across real keys, short enough to keep broker keys compact.
        full[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// A broker outage degrades to allow: a rate limiter that rejects every
    /// request when its backing store is unreachable turns a transient
    /// infrastructure blip into a full outage of its own. Fail open here,
    /// the static screening pass and sandbox isolation remain as backstops.
    async fn check(&self, key: &str, limit: i64) -> Verdict {
        match self.broker.incr_with_ttl(key, COUNTER_TTL).await {
            Ok(count) if count <= limit => Verdict::Allowed,
            Ok(_) => Verdict::Limited,
            Err(BrokerError::Transient(_)) | Err(BrokerError::Unavailable(_)) => Verdict::Allowed,
            Err(BrokerError::Decode(_)) => Verdict::Allowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBroker;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(FakeBroker::new()), b"hmac-test-key".to_vec())
    }

    #[tokio::test]
    async fn allows_up_to_the_limit_then_rejects() {
        let limiter = limiter();
        for _ in 0..IP_LIMIT {
            assert_eq!(limiter.check_ip("1.2.3.4", 0).await, Verdict::Allowed);
        }
        assert_eq!(limiter.check_ip("1.2.3.4", 0).await, Verdict::Limited);
    }

    #[tokio::test]
    async fn ip_and_key_windows_are_independent() {
        let limiter = limiter();
        for _ in 0..IP_LIMIT {
            limiter.check_ip("5.5.5.5", 0).await;
        }
        assert_eq!(limiter.check_ip("5.5.5.5", 0).await, Verdict::Limited);
        assert_eq!(limiter.check_key("some-api-key", 0).await, Verdict::Allowed);
    }

    #[tokio::test]
    async fn different_ips_have_separate_buckets() {
        let limiter = limiter();
        for _ in 0..IP_LIMIT {
            limiter.check_ip("9.9.9.9", 0).await;
        }
        assert_eq!(limiter.check_ip("9.9.9.9", 0).await, Verdict::Limited);
        assert_eq!(limiter.check_ip("1.1.1.1", 0).await, Verdict::Allowed);
    }

    #[tokio::test]
    async fn a_new_minute_gets_a_fresh_bucket() {
        let limiter = limiter();
        for _ in 0..IP_LIMIT {
            limiter.check_ip("2.2.2.2", 0).await;
        }
        assert_eq!(limiter.check_ip("2.2.2.2", 0).await, Verdict::Limited);
        assert_eq!(limiter.check_ip("2.2.2.2", 60).await, Verdict::Allowed);
    }
}
