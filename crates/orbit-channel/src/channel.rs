//! The channel contract shared by every transport.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::address_book::{AddressBook, Deliver};
use crate::config::ChannelKind;
use crate::error::{ChannelError, ChannelResult};
use crate::transform::{UnwrapFn, WrapFn};

/// A message received from a system, after unwrapping.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// Channel the frame arrived on.
    pub channel: ChannelKind,
    /// System that sent it.
    pub system: String,
    /// Unwrapped message.
    pub message: Value,
}

/// Shared receive sink every channel of a gateway writes into.
pub type ReceiveSink = mpsc::UnboundedSender<InboundFrame>;

/// Callback receiving `(message, system)` when no sink is attached.
pub type MessageCallback = Arc<dyn Fn(Value, &str) + Send + Sync>;

/// Callback receiving transport errors.
pub type ErrorCallback = Arc<dyn Fn(&ChannelError) + Send + Sync>;

/// A transport multiplexing one or more systems.
///
/// Every method is synchronous; transports run their I/O on background
/// tasks and hand frames to them through per-system pipelines.
pub trait Channel: Send + Sync {
    /// Transport kind.
    fn kind(&self) -> ChannelKind;

    /// Register a system reachable at `destination`.
    ///
    /// UDP channels require a destination; WebSocket channels identify
    /// systems by name and ignore it. Transforms left as `None` follow the
    /// channel default.
    ///
    /// # Errors
    ///
    /// Fails on invalid names, duplicate names or duplicate destinations.
    fn register_system(
        &self,
        name: &str,
        destination: Option<&str>,
        wrap: Option<WrapFn>,
        unwrap: Option<UnwrapFn>,
    ) -> ChannelResult<()>;

    /// Remove a system. Unknown names are ignored.
    fn unregister_system(&self, name: &str);

    /// Send to one system, or to the only registered system when `system`
    /// is `None`.
    ///
    /// # Errors
    ///
    /// Fails when the target cannot be resolved, the wrap fails or the
    /// pipeline is full.
    fn send(&self, data: &Value, system: Option<&str>) -> ChannelResult<()>;

    /// Send to every registered system.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the remaining systems are still written.
    fn send_all(&self, data: &Value) -> ChannelResult<()> {
        let mut first_err = None;
        for name in self.registered_systems() {
            if let Err(err) = self.send(data, Some(&name))
                && first_err.is_none()
            {
                first_err = Some(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Replace the channel-default wrap. See [`AddressBook::set_default_wrap`].
    fn set_wrap(&self, wrap: WrapFn, overwrite_custom: bool);

    /// Replace the channel-default unwrap.
    fn set_unwrap(&self, unwrap: UnwrapFn, overwrite_custom: bool);

    /// Give one system its own transforms, keeping the direction left `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotRegistered`] for unknown systems.
    fn set_system_transform(
        &self,
        name: &str,
        wrap: Option<WrapFn>,
        unwrap: Option<UnwrapFn>,
    ) -> ChannelResult<()>;

    /// Install the inbound message callback.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ReceiveSinkAttached`] while a receive sink is
    /// open. The callback is kept and takes over once the sink closes.
    fn on_message(&self, callback: MessageCallback) -> ChannelResult<()>;

    /// Stop writing to the receive sink.
    fn detach_sink(&self);

    /// Install the transport error callback.
    fn on_connection_error(&self, callback: ErrorCallback);

    /// Registered system names, sorted.
    fn registered_systems(&self) -> Vec<String>;

    /// System name to transport destination.
    fn address_details(&self) -> BTreeMap<String, String>;

    /// Whether `name` is registered here.
    fn has_system(&self, name: &str) -> bool {
        self.registered_systems().iter().any(|s| s == name)
    }

    /// Disconnect every live connection and stop the transport.
    fn close(&self);
}

struct Receivers {
    sink: Option<ReceiveSink>,
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
}

/// State shared by both transports: the address book and inbound routing.
pub(crate) struct ChannelCore<D> {
    kind: ChannelKind,
    book: Mutex<AddressBook<D>>,
    receivers: Mutex<Receivers>,
}

impl<D> ChannelCore<D>
where
    D: Clone + PartialEq + Display,
{
    pub(crate) fn new(kind: ChannelKind, max_pending: Option<usize>, sink: Option<ReceiveSink>) -> Self {
        Self {
            kind,
            book: Mutex::new(AddressBook::new(max_pending)),
            receivers: Mutex::new(Receivers {
                sink,
                on_message: None,
                on_error: None,
            }),
        }
    }

    pub(crate) const fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub(crate) fn book(&self) -> MutexGuard<'_, AddressBook<D>> {
        self.book.lock()
    }

    /// Wrap `data` for its target and write it into the pipeline.
    ///
    /// The wrap runs without the book locked, so it may not call back into
    /// this channel's book but may take as long as it needs.
    pub(crate) fn send(
        &self,
        data: &Value,
        system: Option<&str>,
        transport: &mut impl Deliver<D>,
    ) -> ChannelResult<()> {
        let (name, wrap) = {
            let book = self.book.lock();
            let name = book.target(system)?;
            let wrap = book.wrap_for(&name)?;
            (name, wrap)
        };

        let frame = wrap(data, &name).map_err(|err| ChannelError::Transform {
            system: name.clone(),
            reason: err.to_string(),
        })?;

        self.book.lock().write(&name, frame, transport)
    }

    /// Unwrap a raw frame from `system` and route it to the sink or the
    /// message callback.
    pub(crate) fn receive(&self, system: &str, bytes: &[u8]) {
        let unwrap = match self.book.lock().unwrap_for(system) {
            Ok(unwrap) => unwrap,
            Err(err) => {
                debug!(channel = %self.kind, error = %err, "Dropping frame");
                return;
            }
        };

        match unwrap(bytes, system) {
            Ok(message) => self.deliver(system, message),
            Err(err) => self.report(&ChannelError::Transform {
                system: system.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    fn deliver(&self, system: &str, message: Value) {
        let mut receivers = self.receivers.lock();
        let message = match receivers.sink.take() {
            Some(sink) => {
                let frame = InboundFrame {
                    channel: self.kind,
                    system: system.to_string(),
                    message,
                };
                match sink.send(frame) {
                    Ok(()) => {
                        receivers.sink = Some(sink);
                        return;
                    }
                    Err(mpsc::error::SendError(frame)) => {
                        debug!(channel = %self.kind, "Receive sink closed, switching to callback");
                        frame.message
                    }
                }
            }
            None => message,
        };
        let callback = receivers.on_message.clone();
        drop(receivers);

        match callback {
            Some(callback) => callback(message, system),
            None => debug!(system = %system, "No message receiver, dropping frame"),
        }
    }

    /// Report a transport error to the error callback, or log it.
    pub(crate) fn report(&self, err: &ChannelError) {
        let callback = self.receivers.lock().on_error.clone();
        match callback {
            Some(callback) => callback(err),
            None => warn!(channel = %self.kind, error = %err, "Channel error"),
        }
    }

    pub(crate) fn on_message(&self, callback: MessageCallback) -> ChannelResult<()> {
        let mut receivers = self.receivers.lock();
        receivers.on_message = Some(callback);
        let sink_open = receivers.sink.as_ref().is_some_and(|sink| !sink.is_closed());
        if sink_open {
            return Err(ChannelError::ReceiveSinkAttached);
        }
        receivers.sink = None;
        Ok(())
    }

    pub(crate) fn detach_sink(&self) {
        self.receivers.lock().sink = None;
    }

    pub(crate) fn on_connection_error(&self, callback: ErrorCallback) {
        self.receivers.lock().on_error = Some(callback);
    }
}
