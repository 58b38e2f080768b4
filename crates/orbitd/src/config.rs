//! Daemon configuration.
//!
//! One TOML file names the hub, the channels to open, the systems to
//! register on them and the dispatch mode:
//!
//! ```toml
//! parallel = false
//!
//! [hub]
//! host = "you.example.cloud"
//! gateway_token = "..."
//!
//! [[channels]]
//! kind = "udp"
//! port = 41114
//!
//! [[systems]]
//! name = "sat-1"
//! channel = "udp"
//! destination = "9000"
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, bail};
use orbit_channel::{ChannelConfig, ChannelKind, UdpConfig, WebSocketConfig, validate_system_name};
use orbit_gateway::GatewayConfig;
use orbit_hub::HubConfig;
use serde::{Deserialize, Serialize};

/// A system to register at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEntry {
    /// System name.
    pub name: String,
    /// Channel the system is reached through.
    pub channel: ChannelKind,
    /// Transport destination; required for UDP, ignored for WebSocket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// Everything `orbitd run` needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrbitdConfig {
    /// Dispatch every command at once instead of one per system.
    #[serde(default)]
    pub parallel: bool,
    /// Capacity of the inbound mirror.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_capacity: Option<usize>,
    /// Hub connection.
    pub hub: HubConfig,
    /// Channels to open.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Systems to register.
    #[serde(default)]
    pub systems: Vec<SystemEntry>,
}

impl OrbitdConfig {
    /// Load and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }

    /// A starting point for `orbitd init-config`.
    #[must_use]
    pub fn sample(host: &str, gateway_token: &str) -> Self {
        Self {
            parallel: false,
            mirror_capacity: None,
            hub: HubConfig::new(host, gateway_token),
            channels: vec![
                ChannelConfig::Udp(UdpConfig::new()),
                ChannelConfig::WebSocket(WebSocketConfig::new()),
            ],
            systems: vec![SystemEntry {
                name: "sat-1".to_string(),
                channel: ChannelKind::Udp,
                destination: Some("9000".to_string()),
            }],
        }
    }

    /// Manager configuration derived from this file.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        let config = GatewayConfig::new(self.hub.clone()).with_parallel(self.parallel);
        match self.mirror_capacity {
            Some(capacity) => config.with_mirror_capacity(capacity),
            None => config,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid hub settings, duplicate channels,
    /// duplicate or invalid system names, and systems on channels that are
    /// not opened.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.gateway_config().validate()?;
        if self.mirror_capacity == Some(0) {
            bail!("mirror_capacity must be greater than 0");
        }

        let mut kinds = HashSet::new();
        for channel in &self.channels {
            if !kinds.insert(channel.kind()) {
                bail!("channel {} is listed more than once", channel.kind());
            }
        }

        let mut names = HashSet::new();
        for system in &self.systems {
            validate_system_name(&system.name)?;
            if !names.insert(system.name.as_str()) {
                bail!("system {} is listed more than once", system.name);
            }
            if !kinds.contains(&system.channel) {
                bail!(
                    "system {} uses channel {}, which is not configured",
                    system.name,
                    system.channel
                );
            }
            if system.channel == ChannelKind::Udp && system.destination.is_none() {
                bail!("system {} needs a destination on the udp channel", system.name);
            }
        }
        Ok(())
    }
}
