//! # orbit-gateway
//!
//! The gateway manager: takes commands from the hub, moves each one through
//! its lifecycle and routes it to the system it names, while forwarding
//! system telemetry, events and file listings to the hub.
//!
//! ## Lifecycle
//!
//! ```text
//! received_from_mt -> preparing_on_gateway -> gateway_prep_complete
//!   -> ready_for_system -> uplinking_to_system -> acked_by_system
//!   -> executing_on_system -> downlinking_from_system -> done_on_system
//!   -> processing_on_gateway -> complete_on_gateway -> completed
//! ```
//!
//! Any state may fail; `cancel_on_gateway -> cancelled` may be entered until
//! the system is done. Each state has a default action that a
//! [`Listener`] can replace.
//!
//! ## Example
//!
//! ```rust,ignore
//! use orbit_channel::{ChannelConfig, ChannelKind, UdpConfig};
//! use orbit_gateway::{GatewayConfig, GatewayManager};
//! use orbit_hub::HubConfig;
//!
//! let mut manager = GatewayManager::new(GatewayConfig::new(HubConfig::new("hub.example.com", "token")))?;
//! manager.add_channel(ChannelConfig::Udp(UdpConfig::new())).await?;
//! manager.add_system("sat-1", ChannelKind::Udp, Some("9000"))?;
//! manager.connect_to_hub()?;
//! let (handle, task) = manager.start();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod queue;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use hooks::{
    CommandHook, Listener, PrepContinuation, PrepHandler, ProcessContinuation, Processor, Validator,
};
pub use manager::{GatewayHandle, GatewayManager};
pub use queue::CommandQueue;
