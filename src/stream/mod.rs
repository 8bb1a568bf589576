//! Stream Service: one authenticated push channel per job, bridging broker
//! pub/sub to however many clients are currently watching that job.
//!
//! A "room" is a job's set of live connections plus the single Bridge Task
//! that relays `job:<id>:updates` to them. Rooms and their connection
//! tables are the only shared mutable state in the service, and both are
//! owned by a mutex rather than reached into from request-handling code
//! directly — the connection-table-actor pattern the concurrency model
//! calls for.

mod limiter;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::Broker;
use crate::store::JobStore;
use crate::token::TokenService;

pub use limiter::{ConnectionLimiter, HandshakeVerdict};
use protocol::{BrokerUpdate, ClientMessage, ServerMessage};

const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const LIFETIME_CAP: Duration = Duration::from_secs(3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const ROOM_BROADCAST_CAPACITY: usize = 256;

fn updates_channel(job_id: Uuid) -> String {
    format!("job:{job_id}:updates")
}

struct ConnectionMeta {
    last_activity_unix: AtomicI64,
    connected_at: Instant,
    close: CancellationToken,
}

struct Room {
    tx: broadcast::Sender<ServerMessage>,
    connections: Mutex<HashMap<Uuid, Arc<ConnectionMeta>>>,
    bridge_cancel: CancellationToken,
}

pub enum CloseReason {
    PolicyViolation,
    Internal,
    Normal,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::PolicyViolation => crate::error::ws_close::POLICY_VIOLATION,
            CloseReason::Internal => crate::error::ws_close::INTERNAL_ERROR,
            CloseReason::Normal => crate::error::ws_close::NORMAL,
        }
    }
}

pub struct StreamService {
    broker: Arc<dyn Broker>,
    store: Arc<JobStore>,
    tokens: Arc<TokenService>,
    limiter: ConnectionLimiter,
    rooms: Mutex<HashMap<Uuid, Arc<Room>>>,
}

impl StreamService {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<JobStore>, tokens: Arc<TokenService>) -> Self {
        Self {
            broker,
            store,
            tokens,
            limiter: ConnectionLimiter::new(),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Drives one accepted WebSocket end to end: handshake, initial
    /// snapshot, then the read/broadcast loop until the connection or the
    /// process closes it. The per-IP slot reserved during handshake is
    /// always released on the way out, however the connection ends.
    pub async fn handle_socket(
        self: &Arc<Self>,
        mut socket: WebSocket,
        job_id: Uuid,
        ip: String,
        token: Option<String>,
        now: impl Fn() -> i64,
    ) {
        let verdict = self.limiter.admit_handshake(&ip, Instant::now()).await;
        if verdict != HandshakeVerdict::Allowed {
            let _ = close_with(&mut socket, CloseReason::PolicyViolation).await;
            return;
        }

        let claims = match token.as_deref().map(|t| self.tokens.verify(t, job_id)) {
            Some(Ok(claims)) => claims,
            _ => {
                let _ = close_with(&mut socket, CloseReason::PolicyViolation).await;
                self.limiter.release(&ip).await;
                return;
            }
        };

        // Post-auth pass: a single token can't be replayed into a flood of
        // handshakes by spreading them across source IPs, since this check
        // is keyed on the token's own jti rather than the connecting IP.
        if self.limiter.admit_jti(&claims.jti, Instant::now()).await != HandshakeVerdict::Allowed {
            let _ = close_with(&mut socket, CloseReason::PolicyViolation).await;
            self.limiter.release(&ip).await;
            return;
        }

        let connection_id = Uuid::new_v4();
        let room = self.get_or_create_room(job_id).await;
        let mut room_rx = room.tx.subscribe();
        let meta = Arc::new(ConnectionMeta {
            last_activity_unix: AtomicI64::new(now()),
            connected_at: Instant::now(),
            close: CancellationToken::new(),
        });
        room.connections
            .lock()
            .await
            .insert(connection_id, meta.clone());

        if let Err(e) = self.send_initial_snapshot(&mut socket, job_id, now()).await {
            tracing::debug!(job_id = %job_id, error = %e, "failed to send initial snapshot");
        }

        self.run_connection_loop(&mut socket, &mut room_rx, &meta, job_id, &now)
            .await;

        let mut connections = room.connections.lock().await;
        connections.remove(&connection_id);
        let room_empty = connections.is_empty();
        drop(connections);

        if room_empty {
            self.teardown_room_if_empty(job_id).await;
        }
        self.limiter.release(&ip).await;
    }

    async fn send_initial_snapshot(
        &self,
        socket: &mut WebSocket,
        job_id: Uuid,
        now: i64,
    ) -> Result<(), axum::Error> {
        let snapshot = match self.store.get(job_id).await {
            Ok(Some(job)) => ServerMessage::StatusUpdate {
                status: job.status,
                result: job.result,
                error: job.error,
                timestamp: now,
            },
            Ok(None) => ServerMessage::StatusUpdate {
                status: crate::domain::JobStatus::Unknown,
                result: None,
                error: None,
                timestamp: now,
            },
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        };
        send_message(socket, &snapshot).await
    }

    async fn run_connection_loop(
        &self,
        socket: &mut WebSocket,
        room_rx: &mut broadcast::Receiver<ServerMessage>,
        meta: &Arc<ConnectionMeta>,
        job_id: Uuid,
        now: &impl Fn() -> i64,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = meta.close.cancelled() => {
                    let _ = close_with(socket, CloseReason::Normal).await;
                    return;
                }
                broadcasted = room_rx.recv() => {
                    match broadcasted {
                        Ok(msg) => {
                            if send_message(socket, &msg).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            meta.last_activity_unix.store(now(), Ordering::Relaxed);
                            self.handle_client_message(socket, &text, job_id, now).await;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            meta.last_activity_unix.store(now(), Ordering::Relaxed);
                        }
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => return,
                    }
                }
            }
        }
    }

    async fn handle_client_message(
        &self,
        socket: &mut WebSocket,
        text: &str,
        job_id: Uuid,
        now: &impl Fn() -> i64,
    ) {
        let Ok(parsed) = serde_json::from_str::<ClientMessage>(text) else {
            tracing::debug!(job_id = %job_id, "ignoring malformed client frame");
            return;
        };
        match parsed.kind.as_str() {
            "ping" => {
                let _ = send_message(socket, &ServerMessage::Pong { timestamp: now() }).await;
            }
            other => {
                tracing::debug!(job_id = %job_id, kind = other, "ignoring unrecognized client message type");
            }
        }
    }

    async fn get_or_create_room(self: &Arc<Self>, job_id: Uuid) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(&job_id) {
            return room.clone();
        }

        let (tx, _rx) = broadcast::channel(ROOM_BROADCAST_CAPACITY);
        let bridge_cancel = CancellationToken::new();
        let room = Arc::new(Room {
            tx: tx.clone(),
            connections: Mutex::new(HashMap::new()),
            bridge_cancel: bridge_cancel.clone(),
        });
        rooms.insert(job_id, room.clone());

        let service = self.clone();
        tokio::spawn(async move {
            service.run_bridge(job_id, tx, bridge_cancel).await;
        });

        room
    }

    async fn teardown_room_if_empty(&self, job_id: Uuid) {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(&job_id) {
            if room.connections.try_lock().map(|c| c.is_empty()).unwrap_or(false) {
                room.bridge_cancel.cancel();
                rooms.remove(&job_id);
            }
        }
    }

    /// Subscribes to this job's broker update channel and fans out every
    /// message to the room until the room empties (one iteration after the
    /// last subscriber leaves) or the process shuts down.
    async fn run_bridge(
        &self,
        job_id: Uuid,
        tx: broadcast::Sender<ServerMessage>,
        cancel: CancellationToken,
    ) {
        let mut sub = match self.broker.subscribe(&updates_channel(job_id)).await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "bridge task failed to subscribe, room will rely on resubscribe attempts from new joiners");
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                message = sub.next() => {
                    let Some(raw) = message else { return };
                    let Ok(update) = serde_json::from_str::<BrokerUpdate>(&raw) else {
                        tracing::debug!(job_id = %job_id, "dropping malformed broker update");
                        continue;
                    };
                    if update.job_id != job_id {
                        tracing::warn!(job_id = %job_id, other = %update.job_id, "bridge task received an update for a different job, dropping");
                        continue;
                    }
                    let now = chrono::Utc::now().timestamp();
                    let _ = tx.send(update.into_server_message(now));
                }
            }
        }
    }

    /// Runs forever, disconnecting idle/expired connections every
    /// `SWEEP_INTERVAL`. Intended to run as one background task per
    /// process for the whole service.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken, now: impl Fn() -> i64) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.sweep_once(now()).await,
            }
        }
    }

    async fn sweep_once(&self, now: i64) {
        let rooms = self.rooms.lock().await;
        for room in rooms.values() {
            let connections = room.connections.lock().await;
            for meta in connections.values() {
                let idle = now - meta.last_activity_unix.load(Ordering::Relaxed);
                let lifetime = meta.connected_at.elapsed();
                if idle as u64 > IDLE_TIMEOUT.as_secs() || lifetime > LIFETIME_CAP {
                    meta.close.cancel();
                }
            }
        }
    }
}

async fn send_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).unwrap_or_default();
    socket.send(Message::Text(payload.into())).await
}

async fn close_with(socket: &mut WebSocket, reason: CloseReason) -> Result<(), axum::Error> {
    use axum::extract::ws::CloseFrame;
    socket
        .send(Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: "".into(),
        })))
        .await
}
