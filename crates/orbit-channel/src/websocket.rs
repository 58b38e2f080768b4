//! WebSocket channel: a server each system connects to.
//!
//! A system identifies itself in the upgrade request. The default validator
//! expects a path of `/<system>/<hash_time>` and a `Sec-WebSocket-Protocol`
//! header offering [`protocol_token`] for that pair. Each system has at most
//! one live connection; frames written while it is away are held and sent
//! in order once it reconnects.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelCore, ErrorCallback, MessageCallback, ReceiveSink};
use crate::config::{ChannelKind, WebSocketConfig};
use crate::error::{ChannelError, ChannelResult};
use crate::transform::{validate_system_name, HostError, UnwrapFn, WrapFn};

/// How long a replacing connection waits for the one it supersedes to hand
/// back its unsent frames.
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether an upgrade request may connect, and as which system.
pub type RequestValidator = Arc<dyn Fn(&Request) -> Result<String, HostError> + Send + Sync>;

/// Subprotocol token a system must offer when connecting as `system` with
/// the given `hash_time` path segment.
#[must_use]
pub fn protocol_token(system: &str, hash_time: &str) -> String {
    STANDARD
        .encode(format!("{system}{hash_time}"))
        .replace(['=', '/'], "")
}

/// Default upgrade validator.
///
/// # Errors
///
/// Rejects requests without `/<system>/<hash_time>` in the path, without a
/// `Sec-WebSocket-Protocol` header containing the matching token, or with
/// an invalid system name.
pub fn validate_request(request: &Request) -> Result<String, HostError> {
    let path = request.uri().path();
    let mut segments = path.split('/').filter(|segment| !segment.is_empty());
    let system = segments.next().ok_or("no system name in request path")?;
    let hash_time = segments.next().ok_or("no hash time in request path")?;

    let offered = request
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .ok_or("no Sec-WebSocket-Protocol header")?;
    if !offered.contains(&protocol_token(system, hash_time)) {
        return Err(format!("could not validate connection request for {path}").into());
    }

    validate_system_name(system)?;
    Ok(system.to_string())
}

enum WsOutbound {
    Frame(Vec<u8>),
    Close,
}

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<WsOutbound>,
    /// Resolves once this connection has handed back its unsent frames.
    retired: oneshot::Receiver<()>,
    /// Whatever this connection replaced has been handed over.
    handed_over: bool,
}

/// A connection newly made live for its system.
struct Attachment {
    id: u64,
    outbound: mpsc::UnboundedReceiver<WsOutbound>,
    retired: oneshot::Sender<()>,
    previous: Option<oneshot::Receiver<()>>,
}

struct Shared {
    core: ChannelCore<String>,
    connections: Mutex<HashMap<String, Connection>>,
    validator: RequestValidator,
    protocol: ProtocolConfig,
    next_id: AtomicU64,
}

impl Shared {
    /// Hand a frame to the system's live connection, if any.
    ///
    /// Called with the address book locked; never locks it.
    fn deliver(&self, system: &String, frame: Vec<u8>) -> Result<(), Vec<u8>> {
        let connections = self.connections.lock();
        let Some(connection) = connections.get(system) else {
            return Err(frame);
        };
        connection
            .tx
            .send(WsOutbound::Frame(frame))
            .map_err(|err| match err.0 {
                WsOutbound::Frame(frame) => frame,
                WsOutbound::Close => Vec::new(),
            })
    }

    /// Make a new connection the live one for `system`, closing any older one.
    ///
    /// The system's pipeline is paused first so nothing written from here
    /// on overtakes frames the older connection still has to hand back.
    fn attach(&self, system: &str) -> Attachment {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, outbound) = mpsc::unbounded_channel();
        let (retired_tx, retired_rx) = oneshot::channel();

        let mut book = self.core.book();
        if book.contains(system) {
            let _ = book.set_connected(system, false, &mut |_: &String, frame: Vec<u8>| -> Result<(), Vec<u8>> { Err(frame) });
        }
        let previous = self.connections.lock().insert(
            system.to_string(),
            Connection {
                id,
                tx,
                retired: retired_rx,
                handed_over: false,
            },
        );
        drop(book);

        let previous = previous.map(|previous| {
            debug!(system = %system, "Replacing existing connection");
            let _ = previous.tx.send(WsOutbound::Close);
            previous.retired
        });
        Attachment {
            id,
            outbound,
            retired: retired_tx,
            previous,
        }
    }

    /// Forget connection `id` of `system` and keep its unsent frames.
    fn detach(&self, system: &str, id: u64, unsent: Vec<Vec<u8>>) {
        let was_live = {
            let mut connections = self.connections.lock();
            let live = connections.get(system).is_some_and(|c| c.id == id);
            if live {
                connections.remove(system);
            }
            live
        };

        if !unsent.is_empty() {
            debug!(system = %system, frames = unsent.len(), "Requeueing unsent frames");
        }
        let mut book = self.core.book();
        book.requeue_front(system, unsent);
        if was_live {
            return;
        }

        // A newer connection took over. If it already finished its handoff
        // the requeue paused it, so flush to it again.
        let resumed = self
            .connections
            .lock()
            .get(system)
            .is_some_and(|connection| connection.handed_over);
        let result = if resumed {
            book.set_connected(system, true, &mut |s: &String, f: Vec<u8>| self.deliver(s, f))
        } else {
            Ok(())
        };
        drop(book);
        if let Err(err) = result {
            self.core.report(&err);
        }
    }

    /// Mark `system` connected once the connection it replaced has handed
    /// back its frames, flushing everything held in order.
    async fn resume(&self, system: &str, id: u64, previous: Option<oneshot::Receiver<()>>) {
        if let Some(previous) = previous
            && tokio::time::timeout(HANDOFF_TIMEOUT, previous).await.is_err()
        {
            warn!(system = %system, "Previous connection did not hand over in time");
        }
        let result = {
            let mut book = self.core.book();
            let current = match self.connections.lock().get_mut(system) {
                Some(connection) if connection.id == id => {
                    connection.handed_over = true;
                    true
                }
                _ => false,
            };
            if current {
                book.set_connected(system, true, &mut |s: &String, f: Vec<u8>| self.deliver(s, f))
            } else {
                Ok(())
            }
        };
        if let Err(err) = result {
            self.core.report(&err);
        }
    }

    fn close_all(&self) {
        let connections: Vec<_> = self.connections.lock().drain().collect();
        for (_, connection) in connections {
            let _ = connection.tx.send(WsOutbound::Close);
        }
    }
}

/// A WebSocket channel.
pub struct WebSocketChannel {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl WebSocketChannel {
    /// Bind the server and start accepting systems.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::BindFailed`] if the listener cannot bind.
    pub async fn bind(
        config: WebSocketConfig,
        sink: Option<ReceiveSink>,
        validator: Option<RequestValidator>,
    ) -> ChannelResult<Arc<Self>> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ChannelError::BindFailed(addr, e))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "WebSocket channel listening");

        let mut protocol = ProtocolConfig::default();
        protocol.max_message_size = Some(config.max_message_size);
        protocol.max_frame_size = Some(config.max_frame_size);

        let shared = Arc::new(Shared {
            core: ChannelCore::new(ChannelKind::WebSocket, config.max_pending, sink),
            connections: Mutex::new(HashMap::new()),
            validator: validator.unwrap_or_else(|| Arc::new(validate_request)),
            protocol,
            next_id: AtomicU64::new(1),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(shared.clone(), listener, shutdown_rx));

        Ok(Arc::new(Self {
            shared,
            local_addr,
            shutdown,
        }))
    }

    /// Address the server listens on.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether a system currently has a live connection.
    #[must_use]
    pub fn is_connected(&self, system: &str) -> bool {
        self.shared.connections.lock().contains_key(system)
    }

    /// Frames held for a system while it is disconnected.
    #[must_use]
    pub fn pending(&self, system: &str) -> usize {
        self.shared.core.book().pending(system)
    }
}

impl Channel for WebSocketChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::WebSocket
    }

    fn register_system(
        &self,
        name: &str,
        _destination: Option<&str>,
        wrap: Option<WrapFn>,
        unwrap: Option<UnwrapFn>,
    ) -> ChannelResult<()> {
        let mut book = self.shared.core.book();
        let connected = self.shared.connections.lock().contains_key(name);
        book.register(name, name.to_string(), wrap, unwrap, connected)
    }

    fn unregister_system(&self, name: &str) {
        if self.shared.core.book().unregister(name).is_none() {
            return;
        }
        if let Some(connection) = self.shared.connections.lock().remove(name) {
            let _ = connection.tx.send(WsOutbound::Close);
        }
    }

    fn send(&self, data: &Value, system: Option<&str>) -> ChannelResult<()> {
        let shared = &self.shared;
        shared
            .core
            .send(data, system, &mut |s: &String, f: Vec<u8>| shared.deliver(s, f))
    }

    fn set_wrap(&self, wrap: WrapFn, overwrite_custom: bool) {
        self.shared.core.book().set_default_wrap(wrap, overwrite_custom);
    }

    fn set_unwrap(&self, unwrap: UnwrapFn, overwrite_custom: bool) {
        self.shared.core.book().set_default_unwrap(unwrap, overwrite_custom);
    }

    fn set_system_transform(
        &self,
        name: &str,
        wrap: Option<WrapFn>,
        unwrap: Option<UnwrapFn>,
    ) -> ChannelResult<()> {
        self.shared.core.book().set_custom(name, wrap, unwrap)
    }

    fn on_message(&self, callback: MessageCallback) -> ChannelResult<()> {
        self.shared.core.on_message(callback)
    }

    fn detach_sink(&self) {
        self.shared.core.detach_sink();
    }

    fn on_connection_error(&self, callback: ErrorCallback) {
        self.shared.core.on_connection_error(callback);
    }

    fn registered_systems(&self) -> Vec<String> {
        self.shared.core.book().names()
    }

    fn address_details(&self) -> BTreeMap<String, String> {
        self.shared.core.book().details()
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
        self.shared.close_all();
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.shared.close_all();
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => match accept_result {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(shared.clone(), stream, peer, shutdown.clone()));
                }
                Err(e) => shared.core.report(&ChannelError::Io(e)),
            },
            _ = shutdown.changed() => break,
        }
    }
    info!("WebSocket channel closed");
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

fn first_protocol(request: &Request) -> Option<HeaderValue> {
    let offered = request.headers().get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    let first = offered.split(',').next()?.trim();
    HeaderValue::from_str(first).ok()
}

fn to_message(frame: Vec<u8>) -> Message {
    match String::from_utf8(frame) {
        Ok(text) => Message::Text(text.into()),
        Err(err) => Message::Binary(err.into_bytes().into()),
    }
}

async fn serve_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut system = None;
    let validator = shared.validator.clone();
    let callback = |request: &Request, mut response: Response| match validator(request) {
        Ok(name) => {
            if let Some(protocol) = first_protocol(request) {
                response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
            }
            system = Some(name);
            Ok(response)
        }
        Err(err) => {
            warn!(peer = %peer, path = %request.uri().path(), error = %err, "Rejected system connection");
            Err(unauthorized(&err.to_string()))
        }
    };

    let ws = match accept_hdr_async_with_config(stream, callback, Some(shared.protocol)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let Some(system) = system else {
        return;
    };

    let Attachment {
        id,
        mut outbound,
        retired,
        previous,
    } = shared.attach(&system);
    {
        let mut book = shared.core.book();
        if !book.contains(&system) {
            if let Err(err) = book.register(&system, system.clone(), None, None, false) {
                drop(book);
                shared.core.report(&err);
                shared.detach(&system, id, Vec::new());
                let _ = retired.send(());
                return;
            }
            info!(system = %system, "Registered system on connect");
        }
    }
    shared.resume(&system, id, previous).await;
    info!(system = %system, peer = %peer, "System connected");

    let (mut write, mut read) = ws.split();
    let mut unsent = Vec::new();
    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(WsOutbound::Frame(frame)) => {
                    if let Err(e) = write.send(to_message(frame.clone())).await {
                        debug!(system = %system, error = %e, "Send to system failed");
                        unsent.push(frame);
                        break;
                    }
                }
                Some(WsOutbound::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.core.receive(&system, text.as_bytes()),
                Some(Ok(Message::Binary(data))) => shared.core.receive(&system, &data),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    shared.core.report(&ChannelError::from(e));
                    break;
                }
            },
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }

    outbound.close();
    while let Ok(next) = outbound.try_recv() {
        if let WsOutbound::Frame(frame) = next {
            unsent.push(frame);
        }
    }
    shared.detach(&system, id, unsent);
    let _ = retired.send(());
    info!(system = %system, "System disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(path: &str, protocol: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(format!("ws://localhost{path}"));
        if let Some(protocol) = protocol {
            builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_protocol_token_strips_padding_and_slashes() {
        let token = protocol_token("sat", "1");
        assert_eq!(token, "c2F0MQ");
        assert_eq!(protocol_token("ab", ""), "YWI");
    }

    #[test]
    fn test_validate_request_accepts_matching_token() {
        let token = protocol_token("sat", "1700000000");
        let req = request("/sat/1700000000", Some(&format!("{token}, other")));
        assert_eq!(validate_request(&req).unwrap(), "sat");
    }

    #[test]
    fn test_validate_request_rejects_wrong_token() {
        let req = request("/sat/1700000000", Some("nope"));
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_validate_request_rejects_missing_parts() {
        assert!(validate_request(&request("/", Some("x"))).is_err());
        assert!(validate_request(&request("/sat", Some("x"))).is_err());
        let token = protocol_token("sat", "1");
        assert!(validate_request(&request("/sat/1", None)).is_err());
        assert!(validate_request(&request("/sat/1", Some(&token))).is_ok());
    }

    #[test]
    fn test_first_protocol_echo() {
        let req = request("/sat/1", Some("alpha, beta"));
        assert_eq!(first_protocol(&req).unwrap(), "alpha");
    }

    #[test]
    fn test_to_message_text_or_binary() {
        assert!(matches!(to_message(b"hi".to_vec()), Message::Text(_)));
        assert!(matches!(to_message(vec![0xff, 0xfe]), Message::Binary(_)));
    }

    // ==================== Connection Handoff ====================

    fn shared(max_pending: Option<usize>) -> Shared {
        let shared = Shared {
            core: ChannelCore::new(ChannelKind::WebSocket, max_pending, None),
            connections: Mutex::new(HashMap::new()),
            validator: Arc::new(validate_request),
            protocol: ProtocolConfig::default(),
            next_id: AtomicU64::new(1),
        };
        shared
            .core
            .book()
            .register("sat", "sat".to_string(), None, None, false)
            .unwrap();
        shared
    }

    fn send_seq(shared: &Shared, seq: u64) {
        shared
            .core
            .send(&json!({"seq": seq}), Some("sat"), &mut |s: &String, f: Vec<u8>| {
                shared.deliver(s, f)
            })
            .unwrap();
    }

    fn queued(outbound: &mut mpsc::UnboundedReceiver<WsOutbound>) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Ok(next) = outbound.try_recv() {
            if let WsOutbound::Frame(frame) = next {
                let value: Value = serde_json::from_slice(&frame).unwrap();
                seqs.push(value["seq"].as_u64().unwrap());
            }
        }
        seqs
    }

    #[tokio::test]
    async fn test_replacement_receives_leftovers_first() {
        let shared = shared(Some(1));
        let mut first = shared.attach("sat");
        shared.resume("sat", first.id, first.previous.take()).await;
        send_seq(&shared, 1);
        send_seq(&shared, 2);

        let mut second = shared.attach("sat");
        send_seq(&shared, 3);
        assert_eq!(shared.core.book().pending("sat"), 1);

        // The superseded connection never wrote 1 and 2.
        let unsent: Vec<Vec<u8>> = std::iter::from_fn(|| first.outbound.try_recv().ok())
            .filter_map(|next| match next {
                WsOutbound::Frame(frame) => Some(frame),
                WsOutbound::Close => None,
            })
            .collect();
        shared.detach("sat", first.id, unsent);
        first.retired.send(()).unwrap();

        shared.resume("sat", second.id, second.previous.take()).await;
        assert_eq!(queued(&mut second.outbound), vec![1, 2, 3]);
        assert_eq!(shared.core.book().pending("sat"), 0);
        assert!(shared.core.book().is_connected("sat"));
    }

    #[tokio::test]
    async fn test_late_handoff_is_still_delivered() {
        let shared = shared(None);
        let first = shared.attach("sat");
        shared.resume("sat", first.id, None).await;

        let mut second = shared.attach("sat");
        // Handoff timed out; the replacement went live without it.
        shared.resume("sat", second.id, None).await;
        send_seq(&shared, 2);

        shared.detach("sat", first.id, vec![serde_json::to_vec(&json!({"seq": 1})).unwrap()]);
        assert_eq!(queued(&mut second.outbound), vec![2, 1]);
        assert!(shared.core.book().is_connected("sat"));
    }
}
