//! Error types for the gateway manager.

use orbit_channel::{ChannelError, ChannelKind};
use orbit_hub::HubError;
use thiserror::Error;

/// Errors raised while configuring or driving the gateway manager.
///
/// Failures inside a command's lifecycle never surface here; they become
/// `failed` transitions reported to the hub.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A hub operation failed.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// The system has no command queue.
    #[error("no command queue exists for system {0}")]
    NoQueue(String),

    /// A translation target is neither a channel kind nor a registered system.
    #[error("{0} is neither an open channel nor a registered system")]
    UnknownTarget(String),

    /// A system was added to a channel kind that has not been opened.
    #[error("channel {0} has not been opened; add it before adding systems to it")]
    ChannelNotOpen(ChannelKind),

    /// A listener was attached to a name that is not a lifecycle state.
    #[error("cannot attach a listener to state {0}: not a lifecycle state")]
    UnknownState(String),

    /// The manager task has stopped.
    #[error("gateway manager has stopped")]
    Stopped,
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
