//! Error types for system channels.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ChannelKind;

/// Errors that can occur in a channel or the channel bus.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// System names must be non-empty and free of whitespace and `/`.
    #[error("invalid system name: {0:?}")]
    InvalidSystemName(String),

    /// The system is already registered on this channel.
    #[error("system {0} is already registered; unregister it first")]
    AlreadyRegistered(String),

    /// Another system already uses this destination.
    #[error("destination {destination} is already registered to system {system}")]
    DestinationInUse {
        /// The contested destination.
        destination: String,
        /// The system holding it.
        system: String,
    },

    /// The destination string could not be understood.
    #[error("invalid destination {0:?}")]
    InvalidDestination(String),

    /// The system is not registered on this channel.
    #[error("system {0} is not registered")]
    NotRegistered(String),

    /// Several systems are registered and none was named.
    #[error("several systems are registered; name one or use send_all")]
    AmbiguousDestination,

    /// No systems are registered.
    #[error("no systems are registered")]
    NoSystems,

    /// A wrap or unwrap transform failed.
    #[error("transform failed for system {system}: {reason}")]
    Transform {
        /// System whose pipeline failed.
        system: String,
        /// What the transform reported.
        reason: String,
    },

    /// An outbound pipeline reached its cap.
    #[error("outbound buffer for {system} is full ({capacity} frames pending)")]
    BufferFull {
        /// System whose pipeline is full.
        system: String,
        /// Configured cap.
        capacity: usize,
    },

    /// A receive sink is attached; detach it before installing a callback.
    #[error("a receive sink is attached; detach it before installing a message callback")]
    ReceiveSinkAttached,

    /// The channel kind is known but has no implementation.
    #[error("{0} channels are not supported")]
    Unsupported(ChannelKind),

    /// The channel kind is not one of `http`, `tcp`, `udp`, `websocket`.
    #[error("unknown channel kind {0:?}; expected one of http, tcp, udp, websocket")]
    UnknownKind(String),

    /// No channel of that kind has been created.
    #[error("channel {0} has not been created")]
    NotCreated(ChannelKind),

    /// Binding the transport failed.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// A socket error on a bound transport.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error on a system connection.
    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
