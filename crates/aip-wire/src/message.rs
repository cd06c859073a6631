//! Wire protocol message types.
//!
//! All communication between workers and the hub uses JSON-framed messages
//! over TCP. Each message is prefixed with a 4-byte big-endian length header.

use aip_types::message::Envelope;
use serde::{Deserialize, Serialize};

/// A wire protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Frame id. Responses carry the id of the request they answer.
    pub id: String,
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

impl WireMessage {
    /// Frame a request under a fresh id.
    pub fn request(req: WireRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Request(req),
        }
    }

    /// Frame a response to the request with id `id`.
    pub fn response(id: impl Into<String>, resp: WireResponse) -> Self {
        Self {
            id: id.into(),
            kind: WireMessageKind::Response(resp),
        }
    }

    /// Frame an error response.
    pub fn error(id: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        Self::response(
            id,
            WireResponse::Error {
                code,
                message: message.into(),
            },
        )
    }

    pub fn notification(notif: WireNotification) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Notification(notif),
        }
    }
}

/// The different kinds of wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    #[serde(rename = "request")]
    Request(WireRequest),
    #[serde(rename = "response")]
    Response(WireResponse),
    /// One-way notification (no response expected).
    #[serde(rename = "notification")]
    Notification(WireNotification),
}

/// Request messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireRequest {
    /// Worker → hub: first frame on every connection.
    #[serde(rename = "handshake")]
    Handshake {
        /// Unique id of this worker connection.
        worker_id: String,
        /// Human-readable worker name.
        #[serde(default)]
        worker_name: String,
        protocol_version: u32,
        /// Agent kinds the worker hosts from the start.
        #[serde(default)]
        kinds: Vec<String>,
        /// Random nonce for HMAC authentication.
        #[serde(default)]
        nonce: String,
        /// HMAC-SHA256(shared_secret, nonce + worker_id).
        #[serde(default)]
        auth_hmac: String,
    },
    /// Worker → hub: host one more agent kind.
    #[serde(rename = "register_kind")]
    RegisterKind { kind: String },
    /// Worker → hub: route an envelope to whoever hosts `envelope.target.kind`.
    #[serde(rename = "send")]
    Send { envelope: Envelope },
    /// Hub → worker: an inbound request for a hosted agent.
    #[serde(rename = "deliver")]
    Deliver { envelope: Envelope },
}

/// Response messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireResponse {
    #[serde(rename = "handshake_ack")]
    HandshakeAck {
        hub_id: String,
        protocol_version: u32,
        #[serde(default)]
        nonce: String,
        #[serde(default)]
        auth_hmac: String,
    },
    #[serde(rename = "kind_registered")]
    KindRegistered { kind: String },
    /// The callee's answer, correlation id echoed.
    #[serde(rename = "reply")]
    Reply { envelope: Envelope },
    /// Error response; see [`codes`].
    #[serde(rename = "error")]
    Error { code: u16, message: String },
}

/// Notification messages (one-way, no response).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WireNotification {
    /// The caller gave up on this call; the callee should stop working on it.
    #[serde(rename = "cancel")]
    Cancel { correlation_id: String },
    /// Worker → hub: stop routing new requests here.
    #[serde(rename = "draining")]
    Draining,
    /// Hub → workers: the hub is going away.
    #[serde(rename = "shutting_down")]
    ShuttingDown,
}

/// Error codes carried in [`WireResponse::Error`].
pub mod codes {
    pub const BAD_REQUEST: u16 = 400;
    pub const AUTH_REQUIRED: u16 = 401;
    pub const AUTH_FAILED: u16 = 403;
    pub const NO_HOST: u16 = 404;
    pub const KIND_CONFLICT: u16 = 409;
    pub const CALLEE_LOST: u16 = 410;
    pub const CODEC_NOT_FOUND: u16 = 415;
    pub const HANDLER_FAILED: u16 = 500;
    pub const DRAINING: u16 = 503;
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
