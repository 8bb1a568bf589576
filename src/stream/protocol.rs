//! Wire format for the per-job streaming connection: JSON frames tagged by
//! `type`, mirroring the collapsed WS/Socket.io-style envelope the original
//! service used for both its transports.

use serde::{Deserialize, Serialize};

use crate::domain::{ExecutionResult, JobStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StatusUpdate {
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<ExecutionResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
}

/// The shape a worker publishes on `job:<id>:updates`. Deliberately
/// permissive: unknown or missing fields don't blow up parsing, since the
/// bridge task must silently drop malformed payloads rather than crash.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerUpdate {
    pub job_id: uuid::Uuid,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<ExecutionResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl BrokerUpdate {
    pub fn into_server_message(self, now: i64) -> ServerMessage {
        ServerMessage::StatusUpdate {
            status: self.status,
            result: self.result,
            error: self.error,
            timestamp: self.timestamp.unwrap_or(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_update_omits_absent_result_and_error() {
        let msg = ServerMessage::StatusUpdate {
            status: JobStatus::Processing,
            result: None,
            error: None,
            timestamp: 1,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("result"));
        assert!(!json.contains("error"));
        assert!(json.contains("\"type\":\"status_update\""));
    }

    #[test]
    fn client_ping_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert_eq!(msg.kind, "ping");
    }

    #[test]
    fn broker_update_with_missing_timestamp_falls_back_to_now() {
        let raw = r#"{"job_id": "00000000-0000-0000-0000-000000000000", "status": "completed"}"#;
        let update: BrokerUpdate = serde_json::from_str(raw).unwrap();
        let msg = update.into_server_message(99);
        match msg {
            ServerMessage::StatusUpdate { timestamp, .. } => assert_eq!(timestamp, 99),
            _ => panic!("expected status update"),
        }
    }
}
