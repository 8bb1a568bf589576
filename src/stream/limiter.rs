//! Per-IP limits for the streaming handshake: a concurrent-connection cap
//! and a handshake-rate cap, each independent of the HTTP admission
//! gateway's rate limiter. State is in-process — the Stream Service's
//! connection table is itself per-process, so there is no cross-process
//! coordination need here the way there is for the broker-backed counters.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub const MAX_CONCURRENT_PER_IP: usize = 10;
pub const MAX_HANDSHAKES_PER_MINUTE: usize = 60;
const HANDSHAKE_WINDOW: Duration = Duration::from_secs(60);
const BAN_DURATION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeVerdict {
    Allowed,
    TooManyConnections,
    TooManyHandshakes,
    Banned,
}

struct IpState {
    active_connections: usize,
    handshakes: VecDeque<Instant>,
    banned_until: Option<Instant>,
}

impl IpState {
    fn new() -> Self {
        Self {
            active_connections: 0,
            handshakes: VecDeque::new(),
            banned_until: None,
        }
    }
}

pub struct ConnectionLimiter {
    state: Mutex<HashMap<String, IpState>>,
}

impl ConnectionLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Checks the handshake-rate and concurrent-connection limits for `ip`
    /// and, if allowed, reserves a connection slot. Callers must call
    /// [`Self::release`] exactly once the connection eventually closes.
    pub async fn admit_handshake(&self, ip: &str, now: Instant) -> HandshakeVerdict {
        let mut state = self.state.lock().await;
        let entry = state.entry(ip.to_string()).or_insert_with(IpState::new);

        if let Some(until) = entry.banned_until {
            if now < until {
                return HandshakeVerdict::Banned;
            }
            entry.banned_until = None;
        }

        while entry
            .handshakes
            .front()
            .is_some_and(|t| now.duration_since(*t) > HANDSHAKE_WINDOW)
        {
            entry.handshakes.pop_front();
        }

        if entry.handshakes.len() >= MAX_HANDSHAKES_PER_MINUTE {
            entry.banned_until = Some(now + BAN_DURATION);
            return HandshakeVerdict::TooManyHandshakes;
        }

        if entry.active_connections >= MAX_CONCURRENT_PER_IP {
            entry.banned_until = Some(now + BAN_DURATION);
            return HandshakeVerdict::TooManyConnections;
        }

        entry.handshakes.push_back(now);
        entry.active_connections += 1;
        HandshakeVerdict::Allowed
    }

    /// Second, post-auth rate-limit pass keyed on the stream token's `jti`
    /// (spec §4.6 step 4), run in addition to the per-IP check already
    /// applied pre-auth: a leaked token can't be replayed into a flood of
    /// handshakes just by spreading them across different source IPs.
    /// There is no concurrent-connection cap here and no matching
    /// `release` — unlike an IP slot, a jti isn't held open, only counted
    /// against its own handshake-rate window.
    pub async fn admit_jti(&self, jti: &str, now: Instant) -> HandshakeVerdict {
        let mut state = self.state.lock().await;
        let entry = state
            .entry(format!("jti:{jti}"))
            .or_insert_with(IpState::new);

        if let Some(until) = entry.banned_until {
            if now < until {
                return HandshakeVerdict::Banned;
            }
            entry.banned_until = None;
        }

        while entry
            .handshakes
            .front()
            .is_some_and(|t| now.duration_since(*t) > HANDSHAKE_WINDOW)
        {
            entry.handshakes.pop_front();
        }

        if entry.handshakes.len() >= MAX_HANDSHAKES_PER_MINUTE {
            entry.banned_until = Some(now + BAN_DURATION);
            return HandshakeVerdict::TooManyHandshakes;
        }

        entry.handshakes.push_back(now);
        HandshakeVerdict::Allowed
    }

    pub async fn release(&self, ip: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(ip) {
            entry.active_connections = entry.active_connections.saturating_sub(1);
        }
    }
}

impl Default for ConnectionLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_the_concurrency_cap() {
        let limiter = ConnectionLimiter::new();
        let now = Instant::now();
        for _ in 0..MAX_CONCURRENT_PER_IP {
            assert_eq!(
                limiter.admit_handshake("1.2.3.4", now).await,
                HandshakeVerdict::Allowed
            );
        }
        assert_eq!(
            limiter.admit_handshake("1.2.3.4", now).await,
            HandshakeVerdict::TooManyConnections
        );
    }

    #[tokio::test]
    async fn releasing_a_connection_frees_a_slot() {
        let limiter = ConnectionLimiter::new();
        let now = Instant::now();
        for _ in 0..MAX_CONCURRENT_PER_IP {
            limiter.admit_handshake("1.2.3.4", now).await;
        }
        limiter.release("1.2.3.4").await;
        assert_eq!(
            limiter.admit_handshake("1.2.3.4", now).await,
            HandshakeVerdict::Allowed
        );
    }

    #[tokio::test]
    async fn a_ban_blocks_further_handshakes_until_it_expires() {
        let limiter = ConnectionLimiter::new();
        let now = Instant::now();
        for _ in 0..MAX_CONCURRENT_PER_IP {
            limiter.admit_handshake("5.5.5.5", now).await;
        }
        // This one trips the ban.
        assert_eq!(
            limiter.admit_handshake("5.5.5.5", now).await,
            HandshakeVerdict::TooManyConnections
        );
        assert_eq!(
            limiter.admit_handshake("5.5.5.5", now + Duration::from_secs(1)).await,
            HandshakeVerdict::Banned
        );
        assert_eq!(
            limiter
                .admit_handshake("5.5.5.5", now + Duration::from_secs(301))
                .await,
            HandshakeVerdict::Allowed
        );
    }

    #[tokio::test]
    async fn handshake_rate_cap_trips_even_when_concurrency_never_builds_up() {
        let limiter = ConnectionLimiter::new();
        let now = Instant::now();
        for _ in 0..MAX_HANDSHAKES_PER_MINUTE {
            let verdict = limiter.admit_handshake("6.6.6.6", now).await;
            assert_eq!(verdict, HandshakeVerdict::Allowed);
            limiter.release("6.6.6.6").await;
        }
        assert_eq!(
            limiter.admit_handshake("6.6.6.6", now).await,
            HandshakeVerdict::TooManyHandshakes
        );
    }

    #[tokio::test]
    async fn jti_rate_cap_trips_independently_of_the_ip_cap() {
        let limiter = ConnectionLimiter::new();
        let now = Instant::now();
        for _ in 0..MAX_HANDSHAKES_PER_MINUTE {
            assert_eq!(
                limiter.admit_jti("job-1_1700000000", now).await,
                HandshakeVerdict::Allowed
            );
        }
        assert_eq!(
            limiter.admit_jti("job-1_1700000000", now).await,
            HandshakeVerdict::TooManyHandshakes
        );
    }

    #[tokio::test]
    async fn jti_ban_lifts_after_the_ban_duration() {
        let limiter = ConnectionLimiter::new();
        let now = Instant::now();
        for _ in 0..=MAX_HANDSHAKES_PER_MINUTE {
            limiter.admit_jti("job-2_1700000000", now).await;
        }
        assert_eq!(
            limiter
                .admit_jti("job-2_1700000000", now + Duration::from_secs(301))
                .await,
            HandshakeVerdict::Allowed
        );
    }
}
