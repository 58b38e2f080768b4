//! UDP channel: one bound socket shared by every registered system.
//!
//! Systems are addressed by `ip:port`. Inbound datagrams are matched to a
//! system by their source address. While the socket is not bound, outbound
//! frames wait in each system's pipeline.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info};
use url::{Host, Url};

use crate::channel::{Channel, ChannelCore, ErrorCallback, MessageCallback, ReceiveSink};
use crate::config::{ChannelKind, UdpConfig};
use crate::error::{ChannelError, ChannelResult};
use crate::transform::{UnwrapFn, WrapFn};

/// Largest datagram the channel reads.
const MAX_DATAGRAM: usize = 65_535;

type Outbound = mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>;

/// Resolve a UDP destination.
///
/// Accepts a bare port (`"9000"`, meaning `127.0.0.1:9000`), a socket
/// address (`"1.2.3.4:9000"`, `"[::1]:9000"`) or a `host:port` pair whose
/// host name is resolved.
///
/// # Errors
///
/// Returns [`ChannelError::InvalidDestination`] when no port can be found
/// or the host does not resolve.
pub fn parse_destination(destination: &str) -> ChannelResult<SocketAddr> {
    let trimmed = destination.trim();
    let invalid = || ChannelError::InvalidDestination(destination.to_string());

    let addr = if let Ok(port) = trimmed.parse::<u16>() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    } else if let Ok(addr) = trimmed.parse::<SocketAddr>() {
        addr
    } else {
        let url = if trimmed.contains("://") {
            Url::parse(trimmed)
        } else {
            Url::parse(&format!("udp://{trimmed}"))
        }
        .map_err(|_| invalid())?;
        let port = url.port_or_known_default().ok_or_else(invalid)?;

        match url.host().ok_or_else(invalid)? {
            Host::Ipv4(ip) => SocketAddr::new(IpAddr::V4(ip), port),
            Host::Ipv6(ip) => SocketAddr::new(IpAddr::V6(ip), port),
            Host::Domain(name) => (name, port)
                .to_socket_addrs()
                .map_err(|_| invalid())?
                .next()
                .ok_or_else(invalid)?,
        }
    };

    if addr.port() == 0 {
        return Err(invalid());
    }
    Ok(addr)
}

/// A UDP channel.
pub struct UdpChannel {
    core: Arc<ChannelCore<SocketAddr>>,
    outbound: Outbound,
    bound: watch::Receiver<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
}

impl UdpChannel {
    /// Start a UDP channel. The socket binds in the background; use
    /// [`Self::bound`] to wait for it.
    #[must_use]
    pub fn spawn(config: UdpConfig, sink: Option<ReceiveSink>) -> Arc<Self> {
        let core = Arc::new(ChannelCore::new(ChannelKind::Udp, config.max_pending, sink));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (bound_tx, bound) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let server = UdpServer {
            core: core.clone(),
            config,
            outbound: outbound.clone(),
            outbound_rx,
            bound: bound_tx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(server.run());

        Arc::new(Self {
            core,
            outbound,
            bound,
            shutdown,
        })
    }

    /// Address the socket is currently bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.borrow()
    }

    /// Wait until the socket is bound and return its address.
    pub async fn bound(&self) -> Option<SocketAddr> {
        let mut bound = self.bound.clone();
        let addr = bound.wait_for(Option::is_some).await.ok()?;
        *addr
    }

    /// Frames held for a system while the socket is unbound.
    #[must_use]
    pub fn pending(&self, system: &str) -> usize {
        self.core.book().pending(system)
    }
}

fn deliver(outbound: &Outbound) -> impl FnMut(&SocketAddr, Vec<u8>) -> Result<(), Vec<u8>> + '_ {
    |addr, frame| outbound.send((*addr, frame)).map_err(|err| err.0.1)
}

fn refuse(_: &SocketAddr, frame: Vec<u8>) -> Result<(), Vec<u8>> {
    Err(frame)
}

impl Channel for UdpChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Udp
    }

    fn register_system(
        &self,
        name: &str,
        destination: Option<&str>,
        wrap: Option<WrapFn>,
        unwrap: Option<UnwrapFn>,
    ) -> ChannelResult<()> {
        let destination = destination
            .ok_or_else(|| ChannelError::InvalidDestination(String::new()))
            .and_then(parse_destination)?;

        let mut book = self.core.book();
        let connected = self.bound.borrow().is_some();
        book.register(name, destination, wrap, unwrap, connected)
    }

    fn unregister_system(&self, name: &str) {
        self.core.book().unregister(name);
    }

    fn send(&self, data: &Value, system: Option<&str>) -> ChannelResult<()> {
        self.core.send(data, system, &mut deliver(&self.outbound))
    }

    fn set_wrap(&self, wrap: WrapFn, overwrite_custom: bool) {
        self.core.book().set_default_wrap(wrap, overwrite_custom);
    }

    fn set_unwrap(&self, unwrap: UnwrapFn, overwrite_custom: bool) {
        self.core.book().set_default_unwrap(unwrap, overwrite_custom);
    }

    fn set_system_transform(
        &self,
        name: &str,
        wrap: Option<WrapFn>,
        unwrap: Option<UnwrapFn>,
    ) -> ChannelResult<()> {
        self.core.book().set_custom(name, wrap, unwrap)
    }

    fn on_message(&self, callback: MessageCallback) -> ChannelResult<()> {
        self.core.on_message(callback)
    }

    fn detach_sink(&self) {
        self.core.detach_sink();
    }

    fn on_connection_error(&self, callback: ErrorCallback) {
        self.core.on_connection_error(callback);
    }

    fn registered_systems(&self) -> Vec<String> {
        self.core.book().names()
    }

    fn address_details(&self) -> BTreeMap<String, String> {
        self.core.book().details()
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct UdpServer {
    core: Arc<ChannelCore<SocketAddr>>,
    config: UdpConfig,
    outbound: Outbound,
    outbound_rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    bound: watch::Sender<Option<SocketAddr>>,
    shutdown: watch::Receiver<bool>,
}

impl UdpServer {
    async fn run(mut self) {
        let addr = self.config.bind_addr();
        while !*self.shutdown.borrow() {
            match UdpSocket::bind(addr).await {
                Ok(socket) => {
                    let failure = self.serve(&socket).await;
                    self.set_bound(None);
                    match failure {
                        Some(err) => self.core.report(&ChannelError::Io(err)),
                        None => break,
                    }
                }
                Err(err) => self.core.report(&ChannelError::BindFailed(addr, err)),
            }

            debug!(delay = ?self.config.rebind_delay(), "Recreating UDP socket");
            tokio::select! {
                () = sleep(self.config.rebind_delay()) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!(addr = %addr, "UDP channel closed");
    }

    /// Serve one socket until shutdown (`None`) or a fatal socket error.
    async fn serve(&mut self, socket: &UdpSocket) -> Option<io::Error> {
        let local = socket.local_addr().ok();
        info!(addr = ?local, "UDP channel listening");
        self.set_bound(local);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return None,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.dispatch(from, &buf[..len]),
                    Err(err) if is_transient(&err) => {
                        debug!(error = %err, "Ignoring transient UDP receive error");
                    }
                    Err(err) => return Some(err),
                },
                Some((to, frame)) = self.outbound_rx.recv() => {
                    if let Err(err) = socket.send_to(&frame, to).await {
                        if !is_transient(&err) {
                            return Some(err);
                        }
                        debug!(to = %to, error = %err, "Dropping UDP frame");
                    }
                }
            }
        }
    }

    fn set_bound(&self, addr: Option<SocketAddr>) {
        let mut book = self.core.book();
        self.bound.send_replace(addr);
        if addr.is_some() {
            book.set_all_connected(true, &mut deliver(&self.outbound));
        } else {
            book.set_all_connected(false, &mut refuse);
        }
    }

    fn dispatch(&self, from: SocketAddr, datagram: &[u8]) {
        let system = self.core.book().name_for(&from);
        match system {
            Some(system) => self.core.receive(&system, datagram),
            None => debug!(from = %from, "Datagram from unregistered address"),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::WouldBlock
    )
}
