//! Channel bus: at most one live channel per transport kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::channel::{Channel, ReceiveSink};
use crate::config::{ChannelConfig, ChannelKind};
use crate::error::{ChannelError, ChannelResult};
use crate::udp::UdpChannel;
use crate::websocket::{RequestValidator, WebSocketChannel};

/// Registry of the channels a gateway has opened, keyed by kind.
///
/// Every channel created through the bus writes inbound frames into the
/// bus's receive sink.
pub struct ChannelBus {
    channels: RwLock<BTreeMap<ChannelKind, Arc<dyn Channel>>>,
    sink: Option<ReceiveSink>,
    validator: RwLock<Option<RequestValidator>>,
}

impl ChannelBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new(sink: Option<ReceiveSink>) -> Self {
        Self {
            channels: RwLock::new(BTreeMap::new()),
            sink,
            validator: RwLock::new(None),
        }
    }

    /// Whether `kind` names a transport the bus knows about.
    #[must_use]
    pub fn has(kind: &str) -> bool {
        kind.parse::<ChannelKind>().is_ok()
    }

    /// Use a custom upgrade validator for WebSocket channels created later.
    pub fn set_request_validator(&self, validator: RequestValidator) {
        *self.validator.write() = Some(validator);
    }

    /// Open a channel, replacing and closing any channel of the same kind.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot bind.
    pub async fn create(&self, config: ChannelConfig) -> ChannelResult<Arc<dyn Channel>> {
        let channel: Arc<dyn Channel> = match config {
            ChannelConfig::Udp(udp) => UdpChannel::spawn(udp, self.sink.clone()),
            ChannelConfig::WebSocket(ws) => {
                let validator = self.validator.read().clone();
                WebSocketChannel::bind(ws, self.sink.clone(), validator).await?
            }
        };
        self.insert(channel.clone());
        Ok(channel)
    }

    /// Open a channel of `kind` with its default configuration.
    ///
    /// # Errors
    ///
    /// Fails for kinds without an implementation and when the transport
    /// cannot bind.
    pub async fn create_default(&self, kind: ChannelKind) -> ChannelResult<Arc<dyn Channel>> {
        self.create(ChannelConfig::default_for(kind)?).await
    }

    /// Install an already built channel, replacing and closing any channel
    /// of the same kind.
    pub fn insert(&self, channel: Arc<dyn Channel>) {
        let kind = channel.kind();
        let previous = self.channels.write().insert(kind, channel);
        if let Some(previous) = previous {
            info!(channel = %kind, "Replacing channel");
            previous.close();
        }
    }

    /// The channel of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotCreated`] if none has been created.
    pub fn get(&self, kind: ChannelKind) -> ChannelResult<Arc<dyn Channel>> {
        self.channels
            .read()
            .get(&kind)
            .cloned()
            .ok_or(ChannelError::NotCreated(kind))
    }

    /// Whether a channel of `kind` has been created.
    #[must_use]
    pub fn is_active(&self, kind: ChannelKind) -> bool {
        self.channels.read().contains_key(&kind)
    }

    /// Created channels keyed by kind.
    #[must_use]
    pub fn active(&self) -> BTreeMap<ChannelKind, Arc<dyn Channel>> {
        self.channels.read().clone()
    }

    /// Created channels, in kind order.
    #[must_use]
    pub fn all_actives(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.read().values().cloned().collect()
    }

    /// The channel `system` is registered on.
    #[must_use]
    pub fn find_owner(&self, system: &str) -> Option<Arc<dyn Channel>> {
        self.channels
            .read()
            .values()
            .find(|channel| channel.has_system(system))
            .cloned()
    }

    /// Close every channel and empty the bus.
    pub fn close_all(&self) {
        let channels = std::mem::take(&mut *self.channels.write());
        for channel in channels.into_values() {
            channel.close();
        }
    }
}

impl std::fmt::Debug for ChannelBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBus")
            .field("active", &self.channels.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UdpConfig;
    use std::net::{IpAddr, Ipv4Addr};

    fn ephemeral_udp() -> ChannelConfig {
        ChannelConfig::Udp(
            UdpConfig::new()
                .with_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
                .with_port(0),
        )
    }

    #[test]
    fn test_has_known_kinds() {
        assert!(ChannelBus::has("udp"));
        assert!(ChannelBus::has("http"));
        assert!(!ChannelBus::has("serial"));
    }

    #[tokio::test]
    async fn test_get_before_create() {
        let bus = ChannelBus::new(None);
        assert!(matches!(
            bus.get(ChannelKind::Udp),
            Err(ChannelError::NotCreated(ChannelKind::Udp))
        ));
        assert!(bus.active().is_empty());
    }

    #[tokio::test]
    async fn test_create_unsupported() {
        let bus = ChannelBus::new(None);
        assert!(matches!(
            bus.create_default(ChannelKind::Http).await,
            Err(ChannelError::Unsupported(ChannelKind::Http))
        ));
    }

    #[tokio::test]
    async fn test_active_lists_only_created() {
        let bus = ChannelBus::new(None);
        bus.create(ephemeral_udp()).await.unwrap();

        let active = bus.active();
        assert_eq!(active.keys().copied().collect::<Vec<_>>(), vec![ChannelKind::Udp]);
        assert!(bus.is_active(ChannelKind::Udp));
        assert!(!bus.is_active(ChannelKind::WebSocket));
        assert_eq!(bus.all_actives().len(), 1);
    }

    #[tokio::test]
    async fn test_create_replaces_same_kind() {
        let bus = ChannelBus::new(None);
        let first = bus.create(ephemeral_udp()).await.unwrap();
        first.register_system("sat", Some("9000"), None, None).unwrap();

        bus.create(ephemeral_udp()).await.unwrap();
        assert!(bus.get(ChannelKind::Udp).unwrap().registered_systems().is_empty());
        assert!(bus.find_owner("sat").is_none());
    }

    #[tokio::test]
    async fn test_find_owner() {
        let bus = ChannelBus::new(None);
        let udp = bus.create(ephemeral_udp()).await.unwrap();
        udp.register_system("sat", Some("9000"), None, None).unwrap();

        let owner = bus.find_owner("sat").unwrap();
        assert_eq!(owner.kind(), ChannelKind::Udp);
        assert!(bus.find_owner("ghost").is_none());
    }
}
