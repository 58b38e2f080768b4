//! Error types for the orbit-proto crate.

use thiserror::Error;

/// Errors that can occur while encoding or classifying protocol messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a message.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The `type` tag names a message this gateway does not know.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A command state name that is not part of the lifecycle.
    #[error("unknown command state: {0}")]
    UnknownState(String),
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decoding(err.to_string())
    }
}
