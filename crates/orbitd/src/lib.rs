//! # orbitd
//!
//! The orbit gateway daemon. [`config::OrbitdConfig`] describes the hub,
//! channels and systems; [`app::run`] opens them and drives the gateway
//! manager until interrupted.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod config;

pub use config::{OrbitdConfig, SystemEntry};
