//! # orbit-channel
//!
//! System-facing transports for the orbit gateway.
//!
//! - [`Channel`] is the contract every transport implements: register
//!   systems, send to them, and deliver what they send back.
//! - [`UdpChannel`] shares one socket between systems addressed by `ip:port`.
//! - [`WebSocketChannel`] runs a server systems connect to by name.
//! - [`ChannelBus`] holds at most one channel per [`ChannelKind`].
//!
//! Inbound frames go to a shared [`ReceiveSink`] when one is attached and
//! to a per-channel [`MessageCallback`] otherwise.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address_book;
pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod transform;
pub mod udp;
pub mod websocket;

pub use address_book::{AddressBook, Deliver};
pub use bus::ChannelBus;
pub use channel::{Channel, ErrorCallback, InboundFrame, MessageCallback, ReceiveSink};
pub use config::{ChannelConfig, ChannelKind, UdpConfig, WebSocketConfig};
pub use error::{ChannelError, ChannelResult};
pub use transform::{json_unwrap, json_wrap, validate_system_name, HostError, UnwrapFn, WrapFn};
pub use udp::{parse_destination, UdpChannel};
pub use websocket::{protocol_token, validate_request, RequestValidator, WebSocketChannel};
