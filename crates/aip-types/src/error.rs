//! Shared error types for the AIP system.

use thiserror::Error;

/// Top-level error type for the AIP system.
///
/// Transport faults (`DeliveryTimeout`, `ConnectionLost`) are always surfaced
/// to the caller of an RPC; dispatch faults travel as data and never appear
/// here (see [`crate::tool::ToolException`]).
#[derive(Error, Debug)]
pub enum AipError {
    /// No codec is registered for this payload type.
    #[error("Codec not found for payload type: {0}")]
    CodecNotFound(String),

    /// A registered codec failed to encode or decode a payload.
    #[error("Codec error for '{type_name}': {reason}")]
    Codec {
        /// The payload type being processed.
        type_name: String,
        /// Why the codec failed.
        reason: String,
    },

    /// Another live worker already hosts this agent kind.
    #[error("Agent kind already registered by another worker: {0}")]
    KindConflict(String),

    /// No agent is hosted for the requested address.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// The call did not receive a response before its deadline.
    #[error("Delivery timed out after {timeout_ms}ms (correlation_id={correlation_id})")]
    DeliveryTimeout {
        /// Correlation id of the abandoned request.
        correlation_id: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The connection carrying the call dropped before a response arrived.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The runtime is draining or closed and refuses new sends.
    #[error("Runtime is shutting down")]
    ShuttingDown,

    /// The runtime has not been started yet.
    #[error("Runtime is not connected")]
    NotConnected,

    /// The remote side answered with a protocol-level error.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Wire error code.
        code: u16,
        /// Error message from the remote side.
        message: String,
    },

    /// A response arrived with a payload type the caller did not expect.
    #[error("Unexpected payload: expected {expected}, got {actual}")]
    UnexpectedPayload {
        /// The type the caller asked for.
        expected: String,
        /// The type that actually arrived.
        actual: String,
    },

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A discovery store error occurred.
    #[error("Store error: {0}")]
    Store(String),

    /// An identity lookup or signature operation failed.
    #[error("Identity error: {0}")]
    Identity(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AipError {
    /// Whether this error is a transport fault (timeout or lost connection).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AipError::DeliveryTimeout { .. } | AipError::ConnectionLost(_)
        )
    }
}

impl From<serde_json::Error> for AipError {
    fn from(e: serde_json::Error) -> Self {
        AipError::Serialization(e.to_string())
    }
}

/// Alias for Result with AipError.
pub type AipResult<T> = Result<T, AipError>;
