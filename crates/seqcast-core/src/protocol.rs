// ABOUTME: Wire protocol between clients and the connection manager: inbound and outbound message kinds.
// ABOUTME: Messages are JSON objects tagged by a kebab-case `type`, with camelCase fields.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::Event;

/// Errors raised when a client frame cannot be understood.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("binary frames are not supported")]
    BinaryFrame,

    #[error("{message} is not allowed while {state}")]
    UnexpectedMessage {
        message: &'static str,
        state: &'static str,
    },
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Authenticate {
        credential: String,
    },
    Resume {
        #[serde(default)]
        last_sequence_id: Option<u64>,
    },
    HeartbeatAck {
        #[serde(default)]
        nonce: Option<u64>,
    },
    Unsubscribe,
}

impl ClientMessage {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::Resume { .. } => "resume",
            ClientMessage::HeartbeatAck { .. } => "heartbeat-ack",
            ClientMessage::Unsubscribe => "unsubscribe",
        }
    }
}

/// Messages the server sends. Every message that carries events also carries
/// their sequence ids, so clients can detect gaps on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    AuthResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ReplayBatch {
        events: Vec<Arc<Event>>,
        from_seq: u64,
        to_seq: u64,
    },
    Snapshot {
        payload: serde_json::Value,
        at_seq: u64,
    },
    LiveEvent {
        event: Arc<Event>,
        seq: u64,
    },
    HeartbeatProbe {
        nonce: u64,
    },
    ResumeError {
        reason: String,
        retryable: bool,
    },
    Close {
        reason_code: CloseReason,
    },
}

impl ServerMessage {
    pub fn live(event: Arc<Event>) -> Self {
        let seq = event.sequence_id;
        ServerMessage::LiveEvent { event, seq }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    AuthTimeout,
    AuthFailed,
    HeartbeatTimeout,
    QueueOverflow,
    ServerShutdown,
    ProtocolError,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::AuthTimeout => "AUTH_TIMEOUT",
            CloseReason::AuthFailed => "AUTH_FAILED",
            CloseReason::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            CloseReason::QueueOverflow => "QUEUE_OVERFLOW",
            CloseReason::ServerShutdown => "SERVER_SHUTDOWN",
            CloseReason::ProtocolError => "PROTOCOL_ERROR",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
