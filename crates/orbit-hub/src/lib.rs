//! # orbit-hub
//!
//! The gateway's connection to the hub.
//!
//! - [`HubLink`] keeps one WebSocket to the hub alive, reconnecting with a
//!   bounded retry count.
//! - [`OutboundPacer`] enforces a minimum gap between frames sent to the hub.
//! - [`HubSession`] ties both together, gates traffic on the hub's `hello`,
//!   reacts to rate limits and classifies inbound messages.
//! - [`HubUplink`] is the outbound surface the gateway manager programs against.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod link;
pub mod pacer;
pub mod session;
pub mod uplink;

pub use config::{HubConfig, LinkConfig, PacerConfig};
pub use error::{HubError, HubResult};
pub use link::{HubLink, LinkState, LinkTarget, ReconnectDecision, ReconnectTracker};
pub use pacer::{OutboundPacer, PacerAction};
pub use session::{HubCallbacks, HubSession, NoCallbacks, SessionEvent};
pub use uplink::HubUplink;
