//! Reconnecting WebSocket link to the hub.
//!
//! A [`HubLink`] is a handle to a background task that owns at most one
//! WebSocket connection. The task reconnects after `retry_delay` when the
//! connection drops, counts unclean closes, and stays closed once the count
//! reaches `max_retries`. Nothing connects until [`HubLink::open`] or
//! [`HubLink::refresh`] is called.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::{HubConfig, LinkConfig};
use crate::error::{HubError, HubResult};

/// State of the hub link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Never opened.
    Idle,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected.
    Open,
    /// Waiting `retry_delay` before the next attempt.
    Reconnecting,
    /// Gave up after too many unclean closes, or shut down.
    Closed,
}

/// Atomic wrapper for link state.
#[derive(Debug)]
pub struct AtomicLinkState(AtomicU8);

impl AtomicLinkState {
    /// Create a new atomic state.
    #[must_use]
    pub fn new(state: LinkState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> LinkState {
        match self.0.load(Ordering::SeqCst) {
            0 => LinkState::Idle,
            1 => LinkState::Connecting,
            2 => LinkState::Open,
            3 => LinkState::Reconnecting,
            _ => LinkState::Closed,
        }
    }

    /// Store a new state.
    pub fn store(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// What to do after a connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after the retry delay.
    Retry,
    /// Stay closed.
    GiveUp,
}

/// Counts unclean closes and decides whether to reconnect.
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    max_retries: u32,
    attempts: u32,
}

impl ReconnectTracker {
    /// Create a tracker allowing `max_retries` unclean closes.
    #[must_use]
    pub const fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: 0,
        }
    }

    /// The connection stayed open through the confirmation debounce.
    pub fn on_confirmed(&mut self) {
        self.attempts = 0;
    }

    /// A caller asked for a fresh connection.
    pub fn refresh(&mut self) {
        self.attempts = 0;
    }

    /// The connection closed. Failed connection attempts count as unclean.
    pub fn on_close(&mut self, clean: bool) -> ReconnectDecision {
        if !clean {
            self.attempts = self.attempts.saturating_add(1);
        }
        if self.attempts >= self.max_retries {
            ReconnectDecision::GiveUp
        } else {
            ReconnectDecision::Retry
        }
    }

    /// Change the retry limit.
    pub fn set_max_retries(&mut self, max: u32) {
        self.max_retries = max;
    }

    /// Unclean closes since the last confirmation or refresh.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Where the link connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    /// WebSocket URL.
    pub url: String,
    /// `Authorization` header value, if any.
    pub authorization: Option<String>,
}

impl LinkTarget {
    /// Create a target without credentials.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            authorization: None,
        }
    }

    /// Build the target for a hub configuration.
    pub fn from_config(config: &HubConfig) -> HubResult<Self> {
        Ok(Self {
            url: config.url()?.to_string(),
            authorization: config.authorization(),
        })
    }

    fn request(&self) -> HubResult<Request> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(auth) = &self.authorization {
            let value = HeaderValue::from_str(auth)
                .map_err(|e| HubError::InvalidConfig(format!("bad authorization header: {e}")))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }
        Ok(request)
    }
}

#[derive(Debug)]
struct LinkShared {
    state: AtomicLinkState,
    attempts: AtomicU32,
    max_retries: AtomicU32,
    retry_delay_ms: AtomicU64,
    timeout_wait_ms: AtomicU64,
    pending: AtomicUsize,
}

impl LinkShared {
    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.load(Ordering::SeqCst))
    }

    fn timeout_wait(&self) -> Duration {
        Duration::from_millis(self.timeout_wait_ms.load(Ordering::SeqCst))
    }
}

#[derive(Debug)]
enum LinkCommand {
    Open,
    Refresh,
    Send(String),
    Close,
}

/// Handle to the reconnecting hub link.
#[derive(Debug, Clone)]
pub struct HubLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
    shared: Arc<LinkShared>,
    max_pending: Option<usize>,
}

impl HubLink {
    /// Spawn the link task. Must be called within a Tokio runtime.
    ///
    /// Returns the handle and a receiver for text frames from the hub.
    #[must_use]
    pub fn spawn(target: LinkTarget, config: LinkConfig) -> (Self, mpsc::UnboundedReceiver<String>) {
        let shared = Arc::new(LinkShared {
            state: AtomicLinkState::new(LinkState::Idle),
            attempts: AtomicU32::new(0),
            max_retries: AtomicU32::new(config.max_retries),
            retry_delay_ms: AtomicU64::new(config.retry_delay_ms),
            timeout_wait_ms: AtomicU64::new(config.timeout_wait_ms),
            pending: AtomicUsize::new(0),
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let actor = LinkActor {
            target,
            open_confirm: config.open_confirm(),
            send_retry: config.send_retry(),
            shared: Arc::clone(&shared),
            tracker: ReconnectTracker::new(config.max_retries),
            commands: command_rx,
            inbound: inbound_tx,
            pending: VecDeque::new(),
        };
        tokio::spawn(actor.run());

        let link = Self {
            commands: command_tx,
            shared,
            max_pending: config.max_pending,
        };
        (link, inbound_rx)
    }

    /// Start connecting without resetting the retry counter.
    pub fn open(&self) {
        let _ = self.commands.send(LinkCommand::Open);
    }

    /// Reset the retry counter and reconnect unless already open.
    pub fn refresh(&self) {
        let _ = self.commands.send(LinkCommand::Refresh);
    }

    /// Send a text frame, queueing it while the link is not open.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::BufferFull`] when the pending cap is reached and
    /// [`HubError::LinkClosed`] after [`HubLink::close`].
    pub fn send(&self, frame: String) -> HubResult<()> {
        if let Some(capacity) = self.max_pending
            && self.shared.pending.load(Ordering::SeqCst) >= capacity
        {
            return Err(HubError::BufferFull { capacity });
        }
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.commands.send(LinkCommand::Send(frame)).map_err(|_| {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            HubError::LinkClosed
        })
    }

    /// Close the connection and stop the link task.
    pub fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }

    /// Current link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.shared.state.load()
    }

    /// Unclean closes since the last confirmed connection or refresh.
    #[must_use]
    pub fn retry_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Frames accepted but not yet written to the socket.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Current retry limit.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.shared.max_retries.load(Ordering::SeqCst)
    }

    /// Change the retry limit.
    pub fn set_max_retries(&self, max: u32) {
        self.shared.max_retries.store(max, Ordering::SeqCst);
    }

    /// Current retry delay.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.shared.retry_delay()
    }

    /// Change the retry delay. Zero is ignored.
    pub fn set_retry_delay(&self, delay: Duration) {
        if !delay.is_zero() {
            self.shared
                .retry_delay_ms
                .store(delay.as_millis() as u64, Ordering::SeqCst);
        }
    }

    /// Current connection timeout.
    #[must_use]
    pub fn timeout_wait(&self) -> Duration {
        self.shared.timeout_wait()
    }

    /// Change the connection timeout. Zero is ignored.
    pub fn set_timeout_wait(&self, timeout: Duration) {
        if !timeout.is_zero() {
            self.shared
                .timeout_wait_ms
                .store(timeout.as_millis() as u64, Ordering::SeqCst);
        }
    }
}

enum Wake {
    Connect,
    Stop,
}

enum Outcome {
    Closed { clean: bool },
    Stop,
}

struct LinkActor {
    target: LinkTarget,
    open_confirm: Duration,
    send_retry: Duration,
    shared: Arc<LinkShared>,
    tracker: ReconnectTracker,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    inbound: mpsc::UnboundedSender<String>,
    pending: VecDeque<String>,
}

impl LinkActor {
    async fn run(mut self) {
        let mut wake = self.idle().await;

        while let Wake::Connect = wake {
            let clean = match self.connect_and_serve().await {
                Outcome::Stop => break,
                Outcome::Closed { clean } => clean,
            };

            self.tracker
                .set_max_retries(self.shared.max_retries.load(Ordering::SeqCst));
            let decision = self.tracker.on_close(clean);
            self.publish_attempts();

            wake = match decision {
                ReconnectDecision::Retry => {
                    let delay = self.shared.retry_delay();
                    debug!(attempts = self.tracker.attempts(), ?delay, "hub link reconnecting");
                    self.shared.state.store(LinkState::Reconnecting);
                    self.backoff(delay).await
                }
                ReconnectDecision::GiveUp => {
                    warn!(
                        attempts = self.tracker.attempts(),
                        "hub link giving up after repeated failures"
                    );
                    self.shared.state.store(LinkState::Closed);
                    self.idle().await
                }
            };
        }

        self.shared.state.store(LinkState::Closed);
        debug!("hub link stopped");
    }

    fn publish_attempts(&self) {
        self.shared
            .attempts
            .store(self.tracker.attempts(), Ordering::SeqCst);
    }

    fn refresh(&mut self) {
        self.tracker.refresh();
        self.publish_attempts();
    }

    /// Wait for a reason to connect. Pending frames force a refresh every
    /// `send_retry`.
    async fn idle(&mut self) -> Wake {
        loop {
            let retry_pending = !self.pending.is_empty();
            tokio::select! {
                () = sleep(self.send_retry), if retry_pending => {
                    self.refresh();
                    return Wake::Connect;
                }
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Open) => return Wake::Connect,
                    Some(LinkCommand::Refresh) => {
                        self.refresh();
                        return Wake::Connect;
                    }
                    Some(LinkCommand::Send(frame)) => {
                        self.pending.push_back(frame);
                        self.refresh();
                        return Wake::Connect;
                    }
                    Some(LinkCommand::Close) | None => return Wake::Stop,
                }
            }
        }
    }

    /// Sit out the retry delay, accepting frames meanwhile.
    async fn backoff(&mut self, delay: Duration) -> Wake {
        let timer = sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                () = &mut timer => return Wake::Connect,
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Open) => return Wake::Connect,
                    Some(LinkCommand::Refresh) => {
                        self.refresh();
                        return Wake::Connect;
                    }
                    Some(LinkCommand::Send(frame)) => self.pending.push_back(frame),
                    Some(LinkCommand::Close) | None => return Wake::Stop,
                }
            }
        }
    }

    async fn connect_and_serve(&mut self) -> Outcome {
        self.shared.state.store(LinkState::Connecting);

        let request = match self.target.request() {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "cannot build hub request");
                return Outcome::Closed { clean: false };
            }
        };

        let attempt = tokio::time::timeout(
            self.shared.timeout_wait(),
            tokio_tungstenite::connect_async(request),
        );
        let ws = match attempt.await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                warn!(error = %e, "hub connection failed");
                return Outcome::Closed { clean: false };
            }
            Err(_) => {
                warn!("hub connection timed out");
                return Outcome::Closed { clean: false };
            }
        };

        self.shared.state.store(LinkState::Open);
        info!("hub link open");

        let (mut write, mut read) = ws.split();

        while let Some(frame) = self.pending.pop_front() {
            if let Err(e) = write.send(Message::Text(frame.clone().into())).await {
                warn!(error = %e, "hub send failed");
                self.pending.push_front(frame);
                return Outcome::Closed { clean: false };
            }
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        }

        let confirm = sleep(self.open_confirm);
        tokio::pin!(confirm);
        let mut confirmed = false;

        loop {
            tokio::select! {
                () = &mut confirm, if !confirmed => {
                    confirmed = true;
                    self.tracker.on_confirmed();
                    self.publish_attempts();
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let _ = self.inbound.send(text.to_string());
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            let _ = self.inbound.send(text);
                        }
                        Err(_) => warn!("dropping non-UTF-8 frame from hub"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "hub closed the connection");
                        let _ = write.close().await;
                        return Outcome::Closed { clean: true };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "hub connection error");
                        return Outcome::Closed { clean: false };
                    }
                    None => return Outcome::Closed { clean: false },
                },
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Send(frame)) => {
                        if let Err(e) = write.send(Message::Text(frame.clone().into())).await {
                            warn!(error = %e, "hub send failed");
                            self.pending.push_front(frame);
                            return Outcome::Closed { clean: false };
                        }
                        self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    Some(LinkCommand::Refresh) => self.refresh(),
                    Some(LinkCommand::Open) => {}
                    Some(LinkCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Outcome::Stop;
                    }
                }
            }
        }
    }
}
