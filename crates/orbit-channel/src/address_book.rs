//! Per-channel address book.
//!
//! Each registered system owns an outbound pipeline: the wrap and unwrap
//! transforms in effect for it, whether its transport is currently able to
//! take frames, and the frames held back while it is not. Frames leave a
//! pipeline strictly in the order they were written.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;

use tracing::debug;

use crate::error::{ChannelError, ChannelResult};
use crate::transform::{json_unwrap, json_wrap, validate_system_name, UnwrapFn, WrapFn};

/// Hands one wrapped frame to the transport.
///
/// Returns the frame back if the transport could not take it; the pipeline
/// then pauses and keeps the frame at its head.
pub trait Deliver<D> {
    /// Deliver `frame` to `destination`.
    ///
    /// # Errors
    ///
    /// Returns the frame when the transport is gone.
    fn deliver(&mut self, destination: &D, frame: Vec<u8>) -> Result<(), Vec<u8>>;
}

impl<D, F> Deliver<D> for F
where
    F: FnMut(&D, Vec<u8>) -> Result<(), Vec<u8>>,
{
    fn deliver(&mut self, destination: &D, frame: Vec<u8>) -> Result<(), Vec<u8>> {
        self(destination, frame)
    }
}

struct Entry<D> {
    destination: D,
    wrap: WrapFn,
    unwrap: UnwrapFn,
    custom_wrap: bool,
    custom_unwrap: bool,
    connected: bool,
    pending: VecDeque<Vec<u8>>,
}

/// Registered systems of one channel, keyed by system name.
pub struct AddressBook<D> {
    entries: BTreeMap<String, Entry<D>>,
    default_wrap: WrapFn,
    default_unwrap: UnwrapFn,
    max_pending: Option<usize>,
}

impl<D> AddressBook<D>
where
    D: Clone + PartialEq + Display,
{
    /// Create an empty address book with JSON transforms.
    #[must_use]
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            entries: BTreeMap::new(),
            default_wrap: json_wrap(),
            default_unwrap: json_unwrap(),
            max_pending,
        }
    }

    /// Register a system.
    ///
    /// `connected` is the transport's current readiness for this system.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name, a name already registered, or a
    /// destination already held by another system.
    pub fn register(
        &mut self,
        name: &str,
        destination: D,
        wrap: Option<WrapFn>,
        unwrap: Option<UnwrapFn>,
        connected: bool,
    ) -> ChannelResult<()> {
        validate_system_name(name)?;
        if self.entries.contains_key(name) {
            return Err(ChannelError::AlreadyRegistered(name.to_string()));
        }
        if let Some(holder) = self.name_for(&destination) {
            return Err(ChannelError::DestinationInUse {
                destination: destination.to_string(),
                system: holder,
            });
        }

        let entry = Entry {
            destination,
            custom_wrap: wrap.is_some(),
            custom_unwrap: unwrap.is_some(),
            wrap: wrap.unwrap_or_else(|| self.default_wrap.clone()),
            unwrap: unwrap.unwrap_or_else(|| self.default_unwrap.clone()),
            connected,
            pending: VecDeque::new(),
        };
        self.entries.insert(name.to_string(), entry);
        debug!(system = %name, "System registered");
        Ok(())
    }

    /// Remove a system, returning its destination. Unknown names are ignored.
    pub fn unregister(&mut self, name: &str) -> Option<D> {
        let entry = self.entries.remove(name)?;
        if !entry.pending.is_empty() {
            debug!(system = %name, dropped = entry.pending.len(), "Dropping undelivered frames");
        }
        Some(entry.destination)
    }

    /// Resolve which system a send without an explicit target goes to.
    ///
    /// # Errors
    ///
    /// Fails when nothing is registered, when `system` is unknown, or when
    /// `system` is omitted and more than one system is registered.
    pub fn target(&self, system: Option<&str>) -> ChannelResult<String> {
        if self.entries.is_empty() {
            return Err(ChannelError::NoSystems);
        }
        match system {
            Some(name) if self.entries.contains_key(name) => Ok(name.to_string()),
            Some(name) => Err(ChannelError::NotRegistered(name.to_string())),
            None if self.entries.len() == 1 => {
                Ok(self.entries.keys().next().cloned().unwrap_or_default())
            }
            None => Err(ChannelError::AmbiguousDestination),
        }
    }

    /// Wrap function currently in effect for a system.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotRegistered`] for unknown systems.
    pub fn wrap_for(&self, name: &str) -> ChannelResult<WrapFn> {
        self.entry(name).map(|entry| entry.wrap.clone())
    }

    /// Unwrap function currently in effect for a system.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotRegistered`] for unknown systems.
    pub fn unwrap_for(&self, name: &str) -> ChannelResult<UnwrapFn> {
        self.entry(name).map(|entry| entry.unwrap.clone())
    }

    /// Write an already wrapped frame into a system's pipeline.
    ///
    /// The frame goes straight to the transport when the system is
    /// connected and nothing is held back; otherwise it joins the tail of
    /// the pending queue.
    ///
    /// # Errors
    ///
    /// Fails for unknown systems and when the pending queue is at its cap.
    pub fn write(
        &mut self,
        name: &str,
        frame: Vec<u8>,
        transport: &mut impl Deliver<D>,
    ) -> ChannelResult<()> {
        let max_pending = self.max_pending;
        let entry = self.entry_mut(name)?;

        if entry.connected && entry.pending.is_empty() {
            match transport.deliver(&entry.destination, frame) {
                Ok(()) => return Ok(()),
                Err(frame) => {
                    debug!(system = %name, "Transport unavailable, pausing pipeline");
                    entry.connected = false;
                    entry.pending.push_front(frame);
                    return Ok(());
                }
            }
        }

        if let Some(capacity) = max_pending
            && entry.pending.len() >= capacity
        {
            return Err(ChannelError::BufferFull {
                system: name.to_string(),
                capacity,
            });
        }
        entry.pending.push_back(frame);
        Ok(())
    }

    /// Mark a system's transport as able or unable to take frames.
    ///
    /// Connecting drains held frames, oldest first, until the transport
    /// refuses one.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotRegistered`] for unknown systems.
    pub fn set_connected(
        &mut self,
        name: &str,
        connected: bool,
        transport: &mut impl Deliver<D>,
    ) -> ChannelResult<()> {
        let entry = self.entry_mut(name)?;
        entry.connected = connected;
        if connected {
            Self::drain(name, entry, transport);
        }
        Ok(())
    }

    /// Mark every system as able or unable to take frames.
    pub fn set_all_connected(&mut self, connected: bool, transport: &mut impl Deliver<D>) {
        for (name, entry) in &mut self.entries {
            entry.connected = connected;
            if connected {
                Self::drain(name, entry, transport);
            }
        }
    }

    fn drain(name: &str, entry: &mut Entry<D>, transport: &mut impl Deliver<D>) {
        let mut sent = 0usize;
        while let Some(frame) = entry.pending.pop_front() {
            if let Err(frame) = transport.deliver(&entry.destination, frame) {
                entry.pending.push_front(frame);
                entry.connected = false;
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            debug!(system = %name, sent, "Flushed held frames");
        }
    }

    /// Pause a system and put unsent frames back at the head of its queue,
    /// ahead of anything written since.
    pub fn requeue_front(&mut self, name: &str, frames: Vec<Vec<u8>>) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        entry.connected = false;
        for frame in frames.into_iter().rev() {
            entry.pending.push_front(frame);
        }
    }

    /// Replace the channel-default wrap.
    ///
    /// Systems using the default pick up the new function. With
    /// `overwrite_custom`, systems with their own wrap do too. Unwraps,
    /// connection state and held frames are untouched.
    pub fn set_default_wrap(&mut self, wrap: WrapFn, overwrite_custom: bool) {
        for entry in self.entries.values_mut() {
            if overwrite_custom || !entry.custom_wrap {
                entry.wrap = wrap.clone();
                entry.custom_wrap = false;
            }
        }
        self.default_wrap = wrap;
    }

    /// Replace the channel-default unwrap. See [`Self::set_default_wrap`].
    pub fn set_default_unwrap(&mut self, unwrap: UnwrapFn, overwrite_custom: bool) {
        for entry in self.entries.values_mut() {
            if overwrite_custom || !entry.custom_unwrap {
                entry.unwrap = unwrap.clone();
                entry.custom_unwrap = false;
            }
        }
        self.default_unwrap = unwrap;
    }

    /// Give one system its own transforms. `None` keeps that direction
    /// as it is.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotRegistered`] for unknown systems.
    pub fn set_custom(
        &mut self,
        name: &str,
        wrap: Option<WrapFn>,
        unwrap: Option<UnwrapFn>,
    ) -> ChannelResult<()> {
        let entry = self.entry_mut(name)?;
        if let Some(wrap) = wrap {
            entry.wrap = wrap;
            entry.custom_wrap = true;
        }
        if let Some(unwrap) = unwrap {
            entry.unwrap = unwrap;
            entry.custom_unwrap = true;
        }
        Ok(())
    }

    /// Name of the system registered at `destination`.
    #[must_use]
    pub fn name_for(&self, destination: &D) -> Option<String> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.destination == *destination)
            .map(|(name, _)| name.clone())
    }

    /// Whether a system is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Whether a system's transport is currently taking frames.
    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|entry| entry.connected)
    }

    /// Number of frames held for a system.
    #[must_use]
    pub fn pending(&self, name: &str) -> usize {
        self.entries.get(name).map_or(0, |entry| entry.pending.len())
    }

    /// Registered system names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// System name to destination, as text.
    #[must_use]
    pub fn details(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.destination.to_string()))
            .collect()
    }

    /// Number of registered systems.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no systems are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, name: &str) -> ChannelResult<&Entry<D>> {
        self.entries
            .get(name)
            .ok_or_else(|| ChannelError::NotRegistered(name.to_string()))
    }

    fn entry_mut(&mut self, name: &str) -> ChannelResult<&mut Entry<D>> {
        self.entries
            .get_mut(name)
            .ok_or_else(|| ChannelError::NotRegistered(name.to_string()))
    }
}
