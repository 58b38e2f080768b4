//! Hub session adapter.
//!
//! [`HubSession`] owns the hub link, paces everything sent to the hub, and
//! classifies what comes back. Outbound traffic is held until the hub says
//! `hello`; an `error` from the hub re-arms that gate, and a `rate_limit`
//! pauses delivery and widens the gap between frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use orbit_proto::{Command, CommandId, HubMessage, RateLimit};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::link::{HubLink, LinkState, LinkTarget};
use crate::pacer::{OutboundPacer, PacerAction};
use crate::uplink::HubUplink;

/// Capacity of the session event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Host hooks for inbound hub messages.
///
/// Each method returns `true` when it fully handled the message. Returning
/// `false` (the default) lets the session run its default action: log the
/// message and publish a [`SessionEvent`]. For `rate_limit` the default
/// action also throttles the pacer.
pub trait HubCallbacks: Send + Sync {
    /// The hub greeted us.
    fn on_hello(&self, _message: &Value) -> bool {
        false
    }

    /// The hub asked us to slow down.
    fn on_rate_limit(&self, _limit: &RateLimit) -> bool {
        false
    }

    /// A new command arrived.
    fn on_command(&self, _command: &Command) -> bool {
        false
    }

    /// The hub cancelled a command.
    fn on_cancel(&self, _id: CommandId) -> bool {
        false
    }

    /// The hub reported an error.
    fn on_error(&self, _message: &Value) -> bool {
        false
    }

    /// A ground-station transit is expected.
    fn on_transit(&self, _message: &Value) -> bool {
        false
    }

    /// The hub received a blob.
    fn on_received_blob(&self, _message: &Value) -> bool {
        false
    }

    /// Blob data for a transit is complete.
    fn on_blob_data_finished(&self, _message: &Value) -> bool {
        false
    }
}

/// Callbacks that handle nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl HubCallbacks for NoCallbacks {}

/// An inbound hub message no callback handled.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// `hello` arrived.
    Hello(Value),
    /// The session throttled itself.
    RateLimited(RateLimit),
    /// A command arrived.
    Command(Command),
    /// A cancel arrived.
    Cancel(CommandId),
    /// An error arrived.
    Error(Value),
    /// A transit notice arrived.
    Transit(Value),
    /// A received-blob notice arrived.
    ReceivedBlob(Value),
    /// A blob-data-finished notice arrived.
    BlobDataFinished(Value),
}

struct SessionInner {
    config: HubConfig,
    callbacks: Arc<dyn HubCallbacks>,
    pacer: Mutex<OutboundPacer>,
    wake: Notify,
    waiting: AtomicBool,
    closed: AtomicBool,
    link: Mutex<Option<HubLink>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Connection-level adapter between the gateway and the hub.
#[derive(Clone)]
pub struct HubSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for HubSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubSession")
            .field("host", &self.inner.config.host)
            .field("waiting", &self.is_waiting_for_hello())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl HubSession {
    /// Create a session. Nothing connects until [`HubSession::connect`].
    #[must_use]
    pub fn new(config: HubConfig, callbacks: Arc<dyn HubCallbacks>) -> Self {
        let mut pacer = OutboundPacer::new(config.pacer);
        pacer.pause();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(SessionInner {
                config,
                callbacks,
                pacer: Mutex::new(pacer),
                wake: Notify::new(),
                waiting: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                link: Mutex::new(None),
                events,
            }),
        }
    }

    /// Create the hub link on first call; refresh it afterwards.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect(&self) -> HubResult<()> {
        let mut slot = self.inner.link.lock();
        if let Some(link) = slot.as_ref() {
            link.refresh();
            return Ok(());
        }

        let target = LinkTarget::from_config(&self.inner.config)?;
        let (link, inbound) = HubLink::spawn(target, self.inner.config.link);
        info!(host = %self.inner.config.host, "connecting to hub");
        link.open();

        tokio::spawn(pump(Arc::clone(&self.inner), link.clone()));
        tokio::spawn(read_loop(self.clone(), inbound));
        *slot = Some(link);
        Ok(())
    }

    /// Stop delivering and close the hub link.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        if let Some(link) = self.inner.link.lock().take() {
            link.close();
        }
    }

    /// Observe inbound messages no callback handled.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Classify and dispatch one raw message from the hub.
    pub fn handle_message(&self, text: &str) {
        let message = match HubMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "unhandled message from hub");
                return;
            }
        };
        debug!(kind = message.kind(), "message from hub");

        match &message {
            HubMessage::Error(_) => {
                self.inner.waiting.store(true, Ordering::SeqCst);
                self.inner.pacer.lock().pause();
            }
            HubMessage::Hello(_) if self.inner.waiting.swap(false, Ordering::SeqCst) => {
                self.inner.pacer.lock().resume();
                self.inner.wake.notify_one();
            }
            _ => {}
        }

        let callbacks = &self.inner.callbacks;
        match message {
            HubMessage::Hello(body) => {
                if !callbacks.on_hello(&body) {
                    info!("hub handshake complete");
                    self.publish(SessionEvent::Hello(body));
                }
            }
            HubMessage::RateLimit(limit) => {
                if !callbacks.on_rate_limit(&limit) && self.throttle(&limit) {
                    self.publish(SessionEvent::RateLimited(limit));
                }
            }
            HubMessage::Command(command) => {
                if !callbacks.on_command(&command) {
                    info!(command_id = command.id, "command received with no handler");
                    self.publish(SessionEvent::Command(command));
                }
            }
            HubMessage::Cancel { id } => {
                if !callbacks.on_cancel(id) {
                    info!(command_id = id, "cancel received with no handler");
                    self.publish(SessionEvent::Cancel(id));
                }
            }
            HubMessage::Error(body) => {
                if !callbacks.on_error(&body) {
                    warn!(message = %body, "error from hub");
                    self.publish(SessionEvent::Error(body));
                }
            }
            HubMessage::Transit(body) => {
                if !callbacks.on_transit(&body) {
                    info!(message = %body, "hub expects a ground-station transit");
                    self.publish(SessionEvent::Transit(body));
                }
            }
            HubMessage::ReceivedBlob(body) => {
                if !callbacks.on_received_blob(&body) {
                    info!("blob received by hub");
                    self.publish(SessionEvent::ReceivedBlob(body));
                }
            }
            HubMessage::BlobDataFinished(body) => {
                if !callbacks.on_blob_data_finished(&body) {
                    info!("blob data finished");
                    self.publish(SessionEvent::BlobDataFinished(body));
                }
            }
        }
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Pause the pacer and schedule its resumption. Returns `false` when the
    /// pacer was already paused.
    fn throttle(&self, limit: &RateLimit) -> bool {
        let interval = limit.min_interval();
        {
            let mut pacer = self.inner.pacer.lock();
            if pacer.is_paused() {
                return false;
            }
            pacer.pause();
            if let Some(interval) = interval {
                pacer.set_wait_time(interval);
            }
        }

        let delay = limit.retry_after() + interval.unwrap_or(Duration::ZERO);
        warn!(
            interval_ms = interval.map(|i| i.as_millis() as u64),
            resume_in_ms = delay.as_millis() as u64,
            "rate limited by hub, throttling"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            sleep(delay).await;
            if !inner.waiting.load(Ordering::SeqCst) {
                inner.pacer.lock().resume();
                inner.wake.notify_one();
            }
        });
        true
    }

    /// Check whether the session is waiting for `hello`.
    #[must_use]
    pub fn is_waiting_for_hello(&self) -> bool {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Check whether outbound delivery is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.pacer.lock().is_paused()
    }

    /// Pause outbound delivery.
    pub fn pause(&self) {
        self.inner.pacer.lock().pause();
    }

    /// Resume outbound delivery.
    pub fn resume(&self) {
        self.inner.pacer.lock().resume();
        self.inner.wake.notify_one();
    }

    /// Current minimum gap between frames.
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        self.inner.pacer.lock().wait_time()
    }

    /// Change the minimum gap between frames. Zero is ignored.
    pub fn set_wait_time(&self, wait: Duration) {
        self.inner.pacer.lock().set_wait_time(wait);
    }

    /// Frames waiting in the pacer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pacer.lock().len()
    }

    /// State of the hub link, if it exists yet.
    #[must_use]
    pub fn link_state(&self) -> Option<LinkState> {
        self.inner.link.lock().as_ref().map(HubLink::state)
    }

    /// Handle to the hub link, if it exists yet.
    #[must_use]
    pub fn link(&self) -> Option<HubLink> {
        self.inner.link.lock().clone()
    }
}

impl HubUplink for HubSession {
    fn transmit_raw(&self, frame: String) -> HubResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(HubError::LinkClosed);
        }
        self.inner.pacer.lock().push(frame)?;
        self.inner.wake.notify_one();
        Ok(())
    }

    fn connect(&self) -> HubResult<()> {
        Self::connect(self)
    }
}

/// Move paced frames from the pacer onto the link.
async fn pump(inner: Arc<SessionInner>, link: HubLink) {
    while !inner.closed.load(Ordering::SeqCst) {
        let action = inner.pacer.lock().poll(Instant::now());
        match action {
            PacerAction::SendNow(frame) => {
                debug!(bytes = frame.len(), "sending to hub");
                match link.send(frame) {
                    Ok(()) => {}
                    Err(HubError::LinkClosed) => break,
                    Err(e) => warn!(error = %e, "hub link dropped a frame"),
                }
            }
            PacerAction::WaitUntil(deadline) => {
                tokio::select! {
                    () = sleep_until(deadline) => {}
                    () = inner.wake.notified() => {}
                }
            }
            PacerAction::Idle | PacerAction::Paused => inner.wake.notified().await,
        }
    }
    debug!("hub pump stopped");
}

async fn read_loop(session: HubSession, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = inbound.recv().await {
        session.handle_message(&text);
    }
}
