//! # orbit-proto
//!
//! Wire types shared by the orbit gateway crates.
//!
//! - [`Command`] and [`CommandState`] describe one hub directive and its lifecycle.
//! - [`HubMessage`] classifies messages arriving from the hub.
//! - [`OutboundMessage`] builds the JSON envelopes the gateway sends to the hub.
//! - [`SystemMessage`] classifies messages arriving from systems.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod error;
pub mod messages;
pub mod system;

pub use command::{Command, CommandId, CommandState};
pub use error::ProtoError;
pub use messages::{
    now_millis, CommandDefinitions, Event, EventLevel, FileList, HubMessage, Measurement,
    OutboundMessage, RateLimit,
};
pub use system::SystemMessage;
