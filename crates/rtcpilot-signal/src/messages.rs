//! Signaling and pilot control-plane messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rtcpilot_core::RoomId;

use crate::server::ServerStats;

/// Messages exchanged with browsers over the signaling WebSocket
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Join a room with an SDP offer
    Join {
        room_id: String,
        user_id: String,
        sdp: String,
    },

    /// Join accepted, carries the SDP answer
    Joined {
        room_id: String,
        user_id: String,
        sdp: String,
    },

    /// Leave a room
    Leave { room_id: String, user_id: String },

    /// Leave acknowledged
    Left { room_id: String, user_id: String },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Ping for keepalive
    Ping { timestamp: u64 },

    /// Pong response
    Pong { timestamp: u64 },
}

/// Error codes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Message could not be parsed
    InvalidMessage,

    /// Offer was rejected by the SDP rewriter
    InvalidSdp,

    /// Room is shutting down or full
    RoomUnavailable,

    /// Session could not be created (e.g. relay ports exhausted)
    SessionUnavailable,

    /// Leave for a membership this connection does not hold
    NotJoined,

    /// Internal server error
    InternalError,
}

/// Error returned by a [`crate::JoinHandler`]
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct SignalError {
    pub code: ErrorCode,
    pub message: String,
}

impl SignalError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<SignalError> for SignalMessage {
    fn from(e: SignalError) -> Self {
        SignalMessage::Error {
            code: e.code,
            message: e.message,
        }
    }
}

impl SignalMessage {
    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Directive received from the pilot center
#[derive(Clone, Debug, PartialEq)]
pub enum PilotDirective {
    RoomCreate { room_id: RoomId, payload: Value },
    RoomDestroy { room_id: RoomId, payload: Value },
    RoomUpdate { room_id: RoomId, payload: Value },
    /// Any message type this server does not understand
    Unknown {
        kind: String,
        room_id: RoomId,
        payload: Value,
    },
}

/// Wire envelope of a pilot message
#[derive(Debug, Deserialize)]
struct PilotEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    payload: Value,
}

impl PilotDirective {
    /// Parse a pilot JSON message
    ///
    /// Only a missing `type` or invalid JSON is an error; unrecognised
    /// types become [`PilotDirective::Unknown`].
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let env: PilotEnvelope = serde_json::from_str(json)?;
        let PilotEnvelope {
            kind,
            room_id,
            payload,
        } = env;
        Ok(match kind.as_str() {
            "room_create" => Self::RoomCreate { room_id, payload },
            "room_destroy" => Self::RoomDestroy { room_id, payload },
            "room_update" => Self::RoomUpdate { room_id, payload },
            _ => Self::Unknown {
                kind,
                room_id,
                payload,
            },
        })
    }

    pub fn room_id(&self) -> &str {
        match self {
            Self::RoomCreate { room_id, .. }
            | Self::RoomDestroy { room_id, .. }
            | Self::RoomUpdate { room_id, .. }
            | Self::Unknown { room_id, .. } => room_id,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &str {
        match self {
            Self::RoomCreate { .. } => "room_create",
            Self::RoomDestroy { .. } => "room_destroy",
            Self::RoomUpdate { .. } => "room_update",
            Self::Unknown { kind, .. } => kind,
        }
    }
}

/// Receiver of pilot directives
///
/// Directives are delivered one at a time in arrival order.
pub trait PilotNotification: Send + Sync {
    fn on_directive(&self, directive: PilotDirective);

    /// Counts carried in heartbeats
    fn stats(&self) -> ServerStats {
        ServerStats::default()
    }
}

/// Candidate announced to the pilot center on register
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateInfo {
    pub nettype: String,
    pub ip: String,
    pub port: u16,
}

/// Messages sent to the pilot center
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PilotReport {
    /// First message on every connection
    Register {
        server_id: String,
        candidates: Vec<CandidateInfo>,
    },

    /// Periodic liveness report
    Heartbeat {
        timestamp: u64,
        rooms: usize,
        sessions: usize,
    },

    MemberJoined { room_id: String, user_id: String },

    MemberLeft { room_id: String, user_id: String },

    /// A room was closed locally (last member left)
    RoomClosed { room_id: String },
}

impl PilotReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_serialization() {
        let msg = SignalMessage::Join {
            room_id: "room-1".into(),
            user_id: "alice".into(),
            sdp: "v=0".into(),
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"join""#));

        match SignalMessage::from_json(&json).unwrap() {
            SignalMessage::Join { room_id, user_id, .. } => {
                assert_eq!(room_id, "room-1");
                assert_eq!(user_id, "alice");
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_error_message() {
        let msg: SignalMessage = SignalError::new(ErrorCode::InvalidSdp, "no media").into();
        let json = msg.to_json().unwrap();
        assert!(json.contains("invalid_sdp"));
        assert!(json.contains("no media"));
    }

    #[test]
    fn test_pilot_directive_parse() {
        let d = PilotDirective::from_json(r#"{"type":"room_create","room_id":"room-1"}"#).unwrap();
        assert_eq!(
            d,
            PilotDirective::RoomCreate {
                room_id: "room-1".into(),
                payload: Value::Null
            }
        );

        let d = PilotDirective::from_json(
            r#"{"type":"room_update","room_id":"room-1","payload":{"title":"standup"}}"#,
        )
        .unwrap();
        assert_eq!(d.kind(), "room_update");
        match d {
            PilotDirective::RoomUpdate { payload, .. } => {
                assert_eq!(payload, json!({"title": "standup"}));
            }
            _ => panic!("wrong directive"),
        }
    }

    #[test]
    fn test_pilot_unknown_type() {
        let d = PilotDirective::from_json(r#"{"type":"kick_user","room_id":"r"}"#).unwrap();
        assert_eq!(d.kind(), "kick_user");
        assert_eq!(d.room_id(), "r");
        assert!(matches!(d, PilotDirective::Unknown { .. }));

        assert!(PilotDirective::from_json(r#"{"room_id":"r"}"#).is_err());
        assert!(PilotDirective::from_json("not json").is_err());
    }

    #[test]
    fn test_pilot_report_serialization() {
        let report = PilotReport::Register {
            server_id: "abc".into(),
            candidates: vec![CandidateInfo {
                nettype: "udp".into(),
                ip: "1.2.3.4".into(),
                port: 9000,
            }],
        };
        let json = report.to_json().unwrap();
        assert!(json.contains(r#""type":"register""#));
        assert!(json.contains(r#""port":9000"#));
    }
}
