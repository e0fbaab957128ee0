//! Worker <-> master wire messages.
//!
//! Each frame is one JSON object on its own line:
//!
//! ```text
//! {"protocol_version":1,"message":{"type":"heartbeat","worker_id":"w1",...}}
//! ```
//!
//! Every message is safe to apply more than once. Heartbeats carry cumulative
//! stats, and commands carry the master's `generation` so a worker can drop
//! stale or duplicated ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SwarmError};
use crate::stats::StatsSnapshot;

pub const PROTOCOL_VERSION: u32 = 1;

/// Lifecycle reported by a worker in its heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Joining,
    Ready,
    Running,
    Stopping,
    Stopped,
    /// Master unreachable; last target keeps running.
    Missing,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Joining => "joining",
            WorkerState::Ready => "ready",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Missing => "missing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// worker -> master, first frame of every connection. An empty id asks
    /// the master to assign one.
    Register {
        worker_id: String,
        capacity_weight: u32,
    },
    /// worker -> master, every heartbeat interval.
    Heartbeat {
        worker_id: String,
        stats: StatsSnapshot,
        user_count: usize,
        state: WorkerState,
        timestamp: DateTime<Utc>,
    },
    /// master -> worker: this worker's share of the global target.
    Target {
        user_count: usize,
        rate: f64,
        generation: u64,
    },
    StopAll {
        generation: u64,
    },
    ResetStats {
        generation: u64,
    },
    /// Both directions: master confirms a registration (carrying the
    /// assigned id and current generation), worker confirms a command.
    Ack {
        worker_id: String,
        generation: u64,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::Heartbeat { .. } => "heartbeat",
            Message::Target { .. } => "target",
            Message::StopAll { .. } => "stop_all",
            Message::ResetStats { .. } => "reset_stats",
            Message::Ack { .. } => "ack",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: u32,
    pub message: Message,
}

/// Serialize one frame, without the trailing newline.
pub fn encode(message: &Message) -> Result<String> {
    #[derive(Serialize)]
    struct EnvelopeRef<'a> {
        protocol_version: u32,
        message: &'a Message,
    }
    Ok(serde_json::to_string(&EnvelopeRef {
        protocol_version: PROTOCOL_VERSION,
        message,
    })?)
}

/// Parse one frame. Anything malformed or from another protocol version is a
/// [`SwarmError::ProtocolViolation`].
pub fn decode(frame: &str) -> Result<Message> {
    let envelope: Envelope = serde_json::from_str(frame.trim_end())
        .map_err(|e| SwarmError::ProtocolViolation(format!("malformed frame: {}", e)))?;
    if envelope.protocol_version != PROTOCOL_VERSION {
        return Err(SwarmError::ProtocolViolation(format!(
            "protocol version mismatch: expected {}, got {}",
            PROTOCOL_VERSION, envelope.protocol_version
        )));
    }
    Ok(envelope.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{RequestSample, StatsWindow};
    use std::time::Duration;

    #[test]
    fn test_heartbeat_frame() {
        let w = StatsWindow::new("w1");
        w.record(&RequestSample::success("/", Duration::from_millis(12), 10));
        let msg = Message::Heartbeat {
            worker_id: "w1".into(),
            stats: w.snapshot(),
            user_count: 3,
            state: WorkerState::Running,
            timestamp: Utc::now(),
        };
        let frame = encode(&msg).unwrap();
        assert!(frame.starts_with(r#"{"protocol_version":1,"message":{"type":"heartbeat""#));
        assert!(!frame.contains('\n'));
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_decode_target_from_text() {
        let frame = r#"{"protocol_version":1,"message":{"type":"target","user_count":40,"rate":2.5,"generation":7}}"#;
        assert_eq!(
            decode(frame).unwrap(),
            Message::Target {
                user_count: 40,
                rate: 2.5,
                generation: 7
            }
        );
    }

    #[test]
    fn test_rejects_version_mismatch() {
        let frame = r#"{"protocol_version":2,"message":{"type":"stop_all","generation":1}}"#;
        let err = decode(frame).unwrap_err();
        assert!(matches!(err, SwarmError::ProtocolViolation(_)));
        assert!(err.to_string().contains("expected 1, got 2"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(decode("not json"), Err(SwarmError::ProtocolViolation(_))));
        assert!(matches!(
            decode(r#"{"protocol_version":1,"message":{"type":"explode"}}"#),
            Err(SwarmError::ProtocolViolation(_))
        ));
    }
}
