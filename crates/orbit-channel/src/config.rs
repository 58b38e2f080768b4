//! Channel configuration.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Default UDP channel port.
pub const DEFAULT_UDP_PORT: u16 = 41114;

/// Default WebSocket channel port.
pub const DEFAULT_WS_PORT: u16 = 8532;

/// Default delay before a failed UDP socket is recreated.
pub const DEFAULT_REBIND_DELAY: Duration = Duration::from_secs(1);

/// Default maximum WebSocket message size: 16MB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum WebSocket frame size: 4MB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Transport kinds a channel bus knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// HTTP (reserved).
    Http,
    /// TCP (reserved).
    Tcp,
    /// UDP datagrams.
    Udp,
    /// WebSocket server.
    #[serde(rename = "websocket")]
    WebSocket,
}

impl ChannelKind {
    /// Every kind, in bus order.
    pub const ALL: [Self; 4] = [Self::Http, Self::Tcp, Self::Udp, Self::WebSocket];

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::WebSocket => "websocket",
        }
    }

    /// Check whether channels of this kind can be created.
    #[must_use]
    pub const fn is_implemented(&self) -> bool {
        matches!(self, Self::Udp | Self::WebSocket)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lower)
            .ok_or_else(|| ChannelError::UnknownKind(s.to_string()))
    }
}

/// UDP channel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Local address to bind.
    pub host: IpAddr,
    /// Local port to bind.
    pub port: u16,
    /// Delay before recreating a failed socket, in milliseconds.
    pub rebind_delay_ms: u64,
    /// Cap on frames buffered per system while the socket is unbound.
    pub max_pending: Option<usize>,
}

impl UdpConfig {
    /// Create a UDP configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            host: LOCALHOST,
            port: DEFAULT_UDP_PORT,
            rebind_delay_ms: DEFAULT_REBIND_DELAY.as_millis() as u64,
            max_pending: None,
        }
    }

    /// Set the bind address.
    #[must_use]
    pub const fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Set the bind port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the rebind delay. Zero is ignored.
    #[must_use]
    pub const fn with_rebind_delay(mut self, delay: Duration) -> Self {
        if !delay.is_zero() {
            self.rebind_delay_ms = delay.as_millis() as u64;
        }
        self
    }

    /// Cap frames buffered per system.
    #[must_use]
    pub const fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    /// Socket address to bind.
    #[must_use]
    pub const fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Delay before recreating a failed socket.
    #[must_use]
    pub const fn rebind_delay(&self) -> Duration {
        Duration::from_millis(self.rebind_delay_ms)
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket channel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Local address to listen on.
    pub host: IpAddr,
    /// Local port to listen on.
    pub port: u16,
    /// Maximum allowed message size in bytes.
    pub max_message_size: usize,
    /// Maximum allowed frame size in bytes.
    pub max_frame_size: usize,
    /// Cap on frames buffered per system while it is disconnected.
    pub max_pending: Option<usize>,
}

impl WebSocketConfig {
    /// Create a WebSocket configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            host: LOCALHOST,
            port: DEFAULT_WS_PORT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_pending: None,
        }
    }

    /// Set the listen address.
    #[must_use]
    pub const fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Set the listen port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Cap frames buffered per system.
    #[must_use]
    pub const fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    /// Socket address to listen on.
    #[must_use]
    pub const fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for one channel, tagged by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// A UDP channel.
    Udp(UdpConfig),
    /// A WebSocket channel.
    #[serde(rename = "websocket")]
    WebSocket(WebSocketConfig),
}

impl ChannelConfig {
    /// Kind of channel this configures.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        match self {
            Self::Udp(_) => ChannelKind::Udp,
            Self::WebSocket(_) => ChannelKind::WebSocket,
        }
    }

    /// Default configuration for a kind.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unsupported`] for kinds with no implementation.
    pub fn default_for(kind: ChannelKind) -> Result<Self, ChannelError> {
        match kind {
            ChannelKind::Udp => Ok(Self::Udp(UdpConfig::new())),
            ChannelKind::WebSocket => Ok(Self::WebSocket(WebSocketConfig::new())),
            other => Err(ChannelError::Unsupported(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("udp", ChannelKind::Udp)]
    #[test_case("UDP", ChannelKind::Udp)]
    #[test_case("WebSocket", ChannelKind::WebSocket)]
    #[test_case("http", ChannelKind::Http)]
    #[test_case(" tcp ", ChannelKind::Tcp)]
    fn test_kind_parse(input: &str, expected: ChannelKind) {
        assert_eq!(input.parse::<ChannelKind>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!(
            "carrier-pigeon".parse::<ChannelKind>(),
            Err(ChannelError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_udp_defaults() {
        let config = UdpConfig::default();
        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:41114");
        assert_eq!(config.rebind_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_ws_defaults() {
        assert_eq!(WebSocketConfig::default().bind_addr().port(), 8532);
    }

    #[test]
    fn test_channel_config_from_toml() {
        #[derive(Deserialize)]
        struct File {
            channels: Vec<ChannelConfig>,
        }

        let file: File = toml::from_str(
            r#"
            [[channels]]
            kind = "udp"
            port = 5000

            [[channels]]
            kind = "websocket"
            host = "0.0.0.0"
            "#,
        )
        .unwrap();

        assert_eq!(file.channels[0], ChannelConfig::Udp(UdpConfig::new().with_port(5000)));
        assert_eq!(file.channels[1].kind(), ChannelKind::WebSocket);
    }

    #[test]
    fn test_default_for_unsupported() {
        assert!(matches!(
            ChannelConfig::default_for(ChannelKind::Tcp),
            Err(ChannelError::Unsupported(ChannelKind::Tcp))
        ));
    }
}
