//! Error types for the hub connection.

use orbit_proto::ProtoError;
use thiserror::Error;

/// Errors that can occur while talking to the hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub configuration is unusable.
    #[error("invalid hub configuration: {0}")]
    InvalidConfig(String),

    /// Connecting to the hub failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// WebSocket error occurred.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Failed to encode an outbound message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A pending-frame buffer reached its cap.
    #[error("outbound buffer full ({capacity} frames pending)")]
    BufferFull {
        /// Configured maximum number of pending frames.
        capacity: usize,
    },

    /// The link task has stopped.
    #[error("link closed")]
    LinkClosed,
}

impl From<ProtoError> for HubError {
    fn from(err: ProtoError) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;
