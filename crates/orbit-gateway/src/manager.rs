//! The gateway manager and its command lifecycle.
//!
//! [`GatewayManager`] is configured synchronously (channels, systems,
//! handlers, listeners) and then started. Starting moves the lifecycle into
//! one task that owns the command queue, the listener table and the
//! per-command bookkeeping; everything else talks to it through a
//! [`GatewayHandle`] or the hub session's callbacks.
//!
//! Transitions raised while handling a transition run immediately, depth
//! first. Transitions requested by continuations, listeners and the
//! `received_from_mt`/`ready_for_system` defaults are posted back onto the
//! task's queue and run after the current transition returns.

use std::collections::HashMap;
use std::sync::Arc;

use orbit_channel::{
    Channel, ChannelBus, ChannelConfig, ChannelError, ChannelKind, InboundFrame, ReceiveSink,
    UnwrapFn, WrapFn,
};
use orbit_hub::{HubCallbacks, HubResult, HubSession, HubUplink};
use orbit_proto::{Command, CommandId, CommandState, SystemMessage};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::hooks::{
    CommandHook, Hooks, Listener, PrepContinuation, PrepHandler, ProcessContinuation, Processor,
    Validator,
};
use crate::queue::CommandQueue;

/// Work item for the lifecycle task.
pub(crate) enum Event {
    /// Move a command to the named state. Unknown names fail the command.
    Transition {
        state: String,
        command: Command,
        errors: Vec<String>,
    },
    /// A command arrived from the hub.
    HubCommand(Command),
    /// The hub cancelled a command.
    HubCancel(CommandId),
    /// Dispatch whatever the system's queue allows.
    Dispatch(String),
    /// Use a processor for one command only.
    RegisterProcessor(CommandId, Processor),
    AttachListener(CommandState, Listener),
    RemoveListener(CommandState),
    Shutdown,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transition { state, command, errors } => f
                .debug_struct("Transition")
                .field("state", state)
                .field("command_id", &command.id)
                .field("errors", errors)
                .finish(),
            Self::HubCommand(command) => f.debug_tuple("HubCommand").field(&command.id).finish(),
            Self::HubCancel(id) => f.debug_tuple("HubCancel").field(id).finish(),
            Self::Dispatch(system) => f.debug_tuple("Dispatch").field(system).finish(),
            Self::RegisterProcessor(id, _) => f.debug_tuple("RegisterProcessor").field(id).finish(),
            Self::AttachListener(state, _) => f.debug_tuple("AttachListener").field(state).finish(),
            Self::RemoveListener(state) => f.debug_tuple("RemoveListener").field(state).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Forwards hub commands and cancels into the lifecycle task.
struct HubBridge {
    events: mpsc::UnboundedSender<Event>,
}

impl HubCallbacks for HubBridge {
    fn on_command(&self, command: &Command) -> bool {
        self.events.send(Event::HubCommand(command.clone())).is_ok()
    }

    fn on_cancel(&self, id: CommandId) -> bool {
        self.events.send(Event::HubCancel(id)).is_ok()
    }
}

/// Cloneable access to a gateway manager, before or after it starts.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    events: mpsc::UnboundedSender<Event>,
    sink: ReceiveSink,
    mirror: broadcast::Sender<InboundFrame>,
}

impl GatewayHandle {
    fn post(&self, event: Event) -> GatewayResult<()> {
        self.events.send(event).map_err(|_| GatewayError::Stopped)
    }

    /// Inject a command as if the hub had sent it.
    pub fn submit_command(&self, command: Command) -> GatewayResult<()> {
        self.post(Event::HubCommand(command))
    }

    /// Cancel a command as if the hub had asked.
    pub fn cancel(&self, id: CommandId) -> GatewayResult<()> {
        self.post(Event::HubCancel(id))
    }

    /// Move a command to `state`.
    pub fn transition(&self, state: CommandState, command: Command) -> GatewayResult<()> {
        self.post(Event::Transition {
            state: state.as_str().to_string(),
            command,
            errors: Vec::new(),
        })
    }

    /// Fail a command with `errors`.
    pub fn fail(&self, command: Command, errors: Vec<String>) -> GatewayResult<()> {
        self.post(Event::Transition {
            state: CommandState::Failed.as_str().to_string(),
            command,
            errors,
        })
    }

    /// Write a frame into the shared receive sink, as a channel would.
    pub fn write_inbound(&self, frame: InboundFrame) -> GatewayResult<()> {
        self.sink.send(frame).map_err(|_| GatewayError::Stopped)
    }

    /// Observe a copy of every frame arriving on the receive sink.
    #[must_use]
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundFrame> {
        self.mirror.subscribe()
    }

    /// Replace the default action of `state`.
    pub fn attach_listener(&self, state: CommandState, listener: Listener) -> GatewayResult<()> {
        self.post(Event::AttachListener(state, listener))
    }

    /// Restore the default action of `state`.
    pub fn remove_listener(&self, state: CommandState) -> GatewayResult<()> {
        self.post(Event::RemoveListener(state))
    }

    /// Stop the lifecycle task, close every channel and the hub session.
    pub fn shutdown(&self) -> GatewayResult<()> {
        self.post(Event::Shutdown)
    }

    /// Whether the lifecycle task has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.events.is_closed()
    }
}

enum Target {
    Channel(Arc<dyn Channel>),
    System(Arc<dyn Channel>, String),
}

/// Routes hub commands to systems and system traffic to the hub.
pub struct GatewayManager {
    uplink: Arc<dyn HubUplink>,
    session: Option<HubSession>,
    bus: Arc<ChannelBus>,
    queue: CommandQueue,
    hooks: Hooks,
    listeners: HashMap<CommandState, Listener>,
    handle: GatewayHandle,
    events: mpsc::UnboundedReceiver<Event>,
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

impl std::fmt::Debug for GatewayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayManager")
            .field("session", &self.session)
            .field("bus", &self.bus)
            .field("queue", &self.queue)
            .field("hooks", &self.hooks)
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl GatewayManager {
    /// Create a manager talking to the hub described by `config`.
    ///
    /// Nothing connects until [`GatewayManager::connect_to_hub`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(HubBridge {
            events: events_tx.clone(),
        });
        let session = HubSession::new(config.hub.clone(), bridge);
        let uplink: Arc<dyn HubUplink> = Arc::new(session.clone());
        Ok(Self::assemble(&config, uplink, Some(session), events_tx, events_rx))
    }

    /// Create a manager that reports to `uplink` instead of a hub session.
    ///
    /// Hub commands are injected through [`GatewayHandle::submit_command`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_uplink(config: GatewayConfig, uplink: Arc<dyn HubUplink>) -> GatewayResult<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self::assemble(&config, uplink, None, events_tx, events_rx))
    }

    fn assemble(
        config: &GatewayConfig,
        uplink: Arc<dyn HubUplink>,
        session: Option<HubSession>,
        events_tx: mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        let (sink, inbound) = mpsc::unbounded_channel();
        let (mirror, _) = broadcast::channel(config.mirror_capacity);
        let bus = Arc::new(ChannelBus::new(Some(sink.clone())));

        Self {
            uplink,
            session,
            bus,
            queue: CommandQueue::new(config.parallel),
            hooks: Hooks::default(),
            listeners: HashMap::new(),
            handle: GatewayHandle {
                events: events_tx,
                sink,
                mirror,
            },
            events: events_rx,
            inbound,
        }
    }

    // ==================== Channels and Systems ====================

    /// Open a channel, replacing any channel of the same kind.
    ///
    /// # Errors
    ///
    /// Fails for unimplemented kinds and when the transport cannot bind.
    pub async fn add_channel(&self, config: ChannelConfig) -> GatewayResult<Arc<dyn Channel>> {
        let kind = config.kind();
        let channel = self.bus.create(config).await?;
        info!(channel = %kind, "Channel opened");
        Ok(channel)
    }

    /// Register `name` on the open channel of `kind` and give it a queue.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not open or the channel rejects the
    /// registration.
    pub fn add_system(
        &mut self,
        name: &str,
        kind: ChannelKind,
        destination: Option<&str>,
    ) -> GatewayResult<()> {
        let channel = self.bus.get(kind).map_err(|err| match err {
            ChannelError::NotCreated(kind) => GatewayError::ChannelNotOpen(kind),
            other => other.into(),
        })?;
        channel.register_system(name, destination, None, None)?;
        self.queue.add_system(name);
        info!(system = %name, channel = %kind, "System added");
        Ok(())
    }

    fn resolve(&self, targets: &[&str]) -> GatewayResult<Vec<Target>> {
        if targets.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "name the systems or channels to translate for".to_string(),
            ));
        }
        let mut resolved = Vec::with_capacity(targets.len());
        for &target in targets {
            if let Ok(kind) = target.parse::<ChannelKind>()
                && let Ok(channel) = self.bus.get(kind)
            {
                resolved.push(Target::Channel(channel));
            } else if let Some(channel) = self.bus.find_owner(target) {
                resolved.push(Target::System(channel, target.to_string()));
            } else {
                return Err(GatewayError::UnknownTarget(target.to_string()));
            }
        }
        Ok(resolved)
    }

    /// Decode what the targeted channels or systems send with `unwrap`.
    ///
    /// A channel target replaces the channel default; `overwrite_custom`
    /// also replaces per-system transforms on it. A system target gets its
    /// own unwrap and keeps its wrap.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if a target is neither an open
    /// channel nor a registered system.
    pub fn translate_inbound_for(
        &self,
        targets: &[&str],
        unwrap: UnwrapFn,
        overwrite_custom: bool,
    ) -> GatewayResult<()> {
        for target in self.resolve(targets)? {
            match target {
                Target::Channel(channel) => channel.set_unwrap(unwrap.clone(), overwrite_custom),
                Target::System(channel, name) => {
                    channel.set_system_transform(&name, None, Some(unwrap.clone()))?;
                }
            }
        }
        Ok(())
    }

    /// Encode what is sent to the targeted channels or systems with `wrap`.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if a target is neither an open
    /// channel nor a registered system.
    pub fn translate_outbound_for(
        &self,
        targets: &[&str],
        wrap: WrapFn,
        overwrite_custom: bool,
    ) -> GatewayResult<()> {
        for target in self.resolve(targets)? {
            match target {
                Target::Channel(channel) => channel.set_wrap(wrap.clone(), overwrite_custom),
                Target::System(channel, name) => {
                    channel.set_system_transform(&name, Some(wrap.clone()), None)?;
                }
            }
        }
        Ok(())
    }

    // ==================== Lifecycle Hooks ====================

    /// Prepare commands of `command_type` on the gateway.
    pub fn handle_on_gateway(&mut self, command_type: impl Into<String>, handler: PrepHandler) {
        self.hooks.prep_handlers.insert(command_type.into(), handler);
    }

    /// Post-process commands of `command_type` after the system is done.
    pub fn process_on_gateway(&mut self, command_type: impl Into<String>, processor: Processor) {
        self.hooks.processors.insert(command_type.into(), processor);
    }

    /// Validate every command without a type-specific validator.
    pub fn validate_command(&mut self, validator: Validator) {
        self.hooks.validator = Some(validator);
    }

    /// Validate commands of `command_type`.
    pub fn validate_command_type(&mut self, command_type: impl Into<String>, validator: Validator) {
        self.hooks.validators_by_type.insert(command_type.into(), validator);
    }

    /// Observe commands of `command_type` entering `downlinking_from_system`.
    pub fn handle_downlink(&mut self, command_type: impl Into<String>, handler: CommandHook) {
        self.hooks.downlink_handlers.insert(command_type.into(), handler);
    }

    /// Observe cancellations. `cancelled` then follows on the next turn.
    pub fn on_cancelled(&mut self, handler: CommandHook) {
        self.hooks.cancel_handler = Some(handler);
    }

    /// Replace the default action of `state`.
    pub fn attach_listener(&mut self, state: CommandState, listener: Listener) {
        self.listeners.insert(state, listener);
    }

    /// Replace the default action of the state named `state`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownState`] if `state` is not a lifecycle
    /// state.
    pub fn attach_listener_by_name(&mut self, state: &str, listener: Listener) -> GatewayResult<()> {
        let parsed = state
            .parse::<CommandState>()
            .map_err(|_| GatewayError::UnknownState(state.to_string()))?;
        self.attach_listener(parsed, listener);
        Ok(())
    }

    /// Restore the default action of `state`.
    pub fn remove_listener(&mut self, state: CommandState) {
        self.listeners.remove(&state);
    }

    // ==================== Running ====================

    /// Open (or refresh) the hub connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub session is closed.
    pub fn connect_to_hub(&self) -> GatewayResult<()> {
        self.uplink.connect()?;
        Ok(())
    }

    /// The hub session, unless the manager reports to a custom uplink.
    #[must_use]
    pub const fn session(&self) -> Option<&HubSession> {
        self.session.as_ref()
    }

    /// The channels this manager opened.
    #[must_use]
    pub fn bus(&self) -> Arc<ChannelBus> {
        self.bus.clone()
    }

    /// A handle to this manager.
    #[must_use]
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Observe a copy of every frame arriving on the receive sink.
    #[must_use]
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundFrame> {
        self.handle.subscribe_inbound()
    }

    /// Start the lifecycle task.
    pub fn start(self) -> (GatewayHandle, JoinHandle<()>) {
        let handle = self.handle.clone();
        let lifecycle = Lifecycle {
            uplink: self.uplink,
            session: self.session,
            bus: self.bus,
            queue: self.queue,
            hooks: self.hooks,
            listeners: self.listeners,
            id_processors: HashMap::new(),
            commands: HashMap::new(),
            handle: self.handle,
        };
        let task = tokio::spawn(lifecycle.run(self.events, self.inbound));
        (handle, task)
    }
}

fn log_hub_error(result: HubResult<()>, command_id: Option<CommandId>, action: &str) {
    if let Err(err) = result {
        warn!(?command_id, error = %err, "Failed to {action}");
    }
}

struct Lifecycle {
    uplink: Arc<dyn HubUplink>,
    session: Option<HubSession>,
    bus: Arc<ChannelBus>,
    queue: CommandQueue,
    hooks: Hooks,
    listeners: HashMap<CommandState, Listener>,
    id_processors: HashMap<CommandId, Processor>,
    commands: HashMap<CommandId, Command>,
    handle: GatewayHandle,
}

impl Lifecycle {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    ) {
        info!(parallel = self.queue.is_parallel(), "Gateway manager started");
        loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => {
                    if !self.on_event(event) {
                        break;
                    }
                }
                Some(frame) = inbound.recv() => self.on_inbound(frame),
                else => break,
            }
        }
        info!("Gateway manager stopped");
    }

    fn on_event(&mut self, event: Event) -> bool {
        match event {
            Event::Transition { state, command, errors } => self.emit(&state, command, errors),
            Event::HubCommand(command) => {
                info!(command_id = command.id, command_type = %command.command_type, system = %command.system, "Command received");
                self.emit_state(CommandState::ReceivedFromMt, command, Vec::new());
            }
            Event::HubCancel(id) => match self.commands.get(&id).cloned() {
                Some(command) => self.emit_state(CommandState::CancelOnGateway, command, Vec::new()),
                None => debug!(command_id = id, "Ignoring cancel for unknown command"),
            },
            Event::Dispatch(system) => self.dispatch(&system),
            Event::RegisterProcessor(id, processor) => {
                self.id_processors.insert(id, processor);
            }
            Event::AttachListener(state, listener) => {
                self.listeners.insert(state, listener);
            }
            Event::RemoveListener(state) => {
                self.listeners.remove(&state);
            }
            Event::Shutdown => {
                self.bus.close_all();
                if let Some(session) = &self.session {
                    session.close();
                }
                return false;
            }
        }
        true
    }

    fn on_inbound(&mut self, frame: InboundFrame) {
        // Nobody listening is fine.
        let _ = self.handle.mirror.send(frame.clone());

        let InboundFrame { channel, system, message } = frame;
        let message = match SystemMessage::from_value(message) {
            Ok(message) => message,
            Err(err) => {
                warn!(%channel, %system, error = %err, "Ignoring unrecognized system message");
                return;
            }
        };
        debug!(%channel, %system, kind = message.kind(), "System message");

        match message {
            SystemMessage::CommandUpdate(command) => {
                let state = command.state.clone().unwrap_or_default();
                self.emit(&state, command, Vec::new());
            }
            SystemMessage::CommandDefinitions(defs) => log_hub_error(
                self.uplink.update_command_definitions(&defs.system, defs.definitions),
                None,
                "forward command definitions",
            ),
            SystemMessage::Events(events) => {
                log_hub_error(self.uplink.transmit_events(events), None, "forward events");
            }
            SystemMessage::FileList(list) => log_hub_error(
                self.uplink.update_file_list(&list.system, list.files, list.timestamp),
                None,
                "forward file list",
            ),
            SystemMessage::FileMetadataUpdate(raw) => {
                log_hub_error(self.uplink.transmit_value(&raw), None, "forward file metadata");
            }
            SystemMessage::Measurements(measurements) => {
                log_hub_error(self.uplink.transmit_metrics(measurements), None, "forward measurements");
            }
        }
    }

    // ==================== Transitions ====================

    fn emit(&mut self, state: &str, command: Command, errors: Vec<String>) {
        if let Ok(parsed) = state.parse::<CommandState>() {
            self.emit_state(parsed, command, errors);
        } else if !self.commands.contains_key(&command.id) {
            debug!(command_id = command.id, %state, "Ignoring unrecognized state for untracked command");
        } else {
            warn!(command_id = command.id, %state, "Unrecognized command state");
            let reason = format!("Gateway did not understand state {state}");
            self.emit_state(CommandState::Failed, command, vec![reason]);
        }
    }

    fn emit_state(&mut self, state: CommandState, command: Command, errors: Vec<String>) {
        let id = command.id;
        let Some(command) = self.track(state, command) else {
            debug!(command_id = id, %state, "Dropping transition for inactive command");
            return;
        };
        debug!(command_id = command.id, %state, "Transition");

        if let Some(listener) = self.listeners.get(&state).cloned()
            && listener(&command, &errors, &self.handle)
        {
            return;
        }
        self.default_action(state, command, errors);
    }

    fn defer(&self, state: CommandState, command: Command) {
        let event = Event::Transition {
            state: state.as_str().to_string(),
            command,
            errors: Vec::new(),
        };
        if self.handle.events.send(event).is_err() {
            debug!("Lifecycle queue closed; dropping deferred transition");
        }
    }

    /// Fold `update` into the bookkeeping entry for its id.
    ///
    /// Only a hub command opens an entry. Transitions for ids that never
    /// had one, or whose entry was finished, return `None`. Once a command
    /// is cancelling, only `cancelled` or `failed` may follow.
    fn track(&mut self, state: CommandState, update: Command) -> Option<Command> {
        let mut command = match self.commands.get(&update.id) {
            Some(known) => {
                let cancelling = known.state.as_deref() == Some(CommandState::CancelOnGateway.as_str());
                if cancelling && !matches!(state, CommandState::Cancelled | CommandState::Failed) {
                    return None;
                }
                let mut known = known.clone();
                known.merge_update(update);
                known
            }
            None if state == CommandState::ReceivedFromMt => update,
            None => return None,
        };
        command.state = Some(state.as_str().to_string());
        self.commands.insert(command.id, command.clone());
        Some(command)
    }

    fn notify(&self, state: CommandState, command: &Command) {
        log_hub_error(
            self.uplink.transmit_command_update(command.id, state, command.to_map()),
            Some(command.id),
            "report command state",
        );
    }

    fn default_action(&mut self, state: CommandState, command: Command, errors: Vec<String>) {
        match state {
            CommandState::ReceivedFromMt => self.on_received(command),
            CommandState::PreparingOnGateway => self.on_preparing(command),
            CommandState::GatewayPrepComplete => self.on_prep_complete(command),
            CommandState::ReadyForSystem => self.on_ready(command),
            CommandState::UplinkingToSystem => self.on_uplinking(command),
            CommandState::AckedBySystem | CommandState::ExecutingOnSystem => {
                self.notify(state, &command);
            }
            CommandState::DownlinkingFromSystem => {
                self.notify(state, &command);
                if let Some(handler) = self.hooks.downlink_handlers.get(&command.command_type) {
                    handler(&command);
                }
            }
            CommandState::DoneOnSystem => {
                self.release(&command);
                self.emit_state(CommandState::ProcessingOnGateway, command, Vec::new());
            }
            CommandState::ProcessingOnGateway => self.on_processing(command),
            CommandState::CompleteOnGateway => {
                self.emit_state(CommandState::Completed, command, Vec::new());
            }
            CommandState::CancelOnGateway => self.on_cancel(command),
            CommandState::Cancelled => {
                info!(command_id = command.id, "Command cancelled");
                log_hub_error(self.uplink.cancel_command(command.id), Some(command.id), "report cancel");
                self.finish(&command);
            }
            CommandState::Completed => {
                info!(command_id = command.id, "Command completed");
                log_hub_error(
                    self.uplink.complete_command(command.id, command.output.clone()),
                    Some(command.id),
                    "report completion",
                );
                self.finish(&command);
            }
            CommandState::Failed => {
                let errors = if errors.is_empty() {
                    command.errors.clone().unwrap_or_default()
                } else {
                    errors
                };
                warn!(command_id = command.id, ?errors, "Command failed");
                log_hub_error(
                    self.uplink.fail_command(command.id, errors),
                    Some(command.id),
                    "report failure",
                );
                self.finish(&command);
            }
        }
    }

    fn on_received(&mut self, command: Command) {
        if let Err(err) = self.hooks.validate(&command) {
            self.emit_state(CommandState::Failed, command, vec![err.to_string()]);
            return;
        }
        self.notify(CommandState::PreparingOnGateway, &command);
        self.defer(CommandState::PreparingOnGateway, command);
    }

    fn on_preparing(&mut self, command: Command) {
        match self.hooks.prep_handlers.get(&command.command_type).cloned() {
            Some(handler) => {
                let next = PrepContinuation::new(command.clone(), self.handle.events.clone());
                handler(&command, next);
            }
            None => self.emit_state(CommandState::GatewayPrepComplete, command, Vec::new()),
        }
    }

    fn on_prep_complete(&mut self, command: Command) {
        if self.bus.find_owner(&command.system).is_some() {
            self.emit_state(CommandState::ReadyForSystem, command, Vec::new());
        } else {
            let reason = format!("Could not find destination system {}", command.system);
            self.emit_state(CommandState::Failed, command, vec![reason]);
        }
    }

    fn on_ready(&mut self, command: Command) {
        let system = command.system.clone();
        if self.queue.add_system(&system) {
            debug!(%system, "Created queue for auto-registered system");
        }
        if let Err(err) = self.queue.enqueue(command.clone()) {
            self.emit_state(CommandState::Failed, command, vec![err.to_string()]);
            return;
        }
        if self.handle.events.send(Event::Dispatch(system)).is_err() {
            debug!("Lifecycle queue closed; dropping dispatch");
        }
    }

    fn dispatch(&mut self, system: &str) {
        for command in self.queue.drain_ready(system) {
            self.emit_state(CommandState::UplinkingToSystem, command, Vec::new());
        }
    }

    fn on_uplinking(&mut self, command: Command) {
        self.notify(CommandState::UplinkingToSystem, &command);

        let Some(channel) = self.bus.find_owner(&command.system) else {
            let reason = format!("Could not find destination system {}", command.system);
            self.emit_state(CommandState::Failed, command, vec![reason]);
            return;
        };
        let data = Value::Object(command.to_map());
        if let Err(err) = channel.send(&data, Some(&command.system)) {
            self.emit_state(CommandState::Failed, command, vec![err.to_string()]);
        }
    }

    fn on_processing(&mut self, command: Command) {
        self.notify(CommandState::ProcessingOnGateway, &command);

        let processor = self
            .id_processors
            .remove(&command.id)
            .or_else(|| self.hooks.processors.get(&command.command_type).cloned());
        match processor {
            Some(processor) => {
                let next = ProcessContinuation::new(command.clone(), self.handle.events.clone());
                processor(&command, next);
            }
            None => self.emit_state(CommandState::CompleteOnGateway, command, Vec::new()),
        }
    }

    fn on_cancel(&mut self, command: Command) {
        self.queue.remove(&command.system, command.id);
        match self.hooks.cancel_handler.clone() {
            Some(handler) => {
                handler(&command);
                self.defer(CommandState::Cancelled, command);
            }
            None => self.emit_state(CommandState::Cancelled, command, Vec::new()),
        }
    }

    /// Free the system slot held by `command` and dispatch what is next.
    fn release(&mut self, command: &Command) {
        if self.queue.finish(&command.system, command.id) {
            debug!(command_id = command.id, system = %command.system, "Released system slot");
        }
        self.dispatch(&command.system);
    }

    fn finish(&mut self, command: &Command) {
        self.commands.remove(&command.id);
        self.id_processors.remove(&command.id);
        self.queue.remove(&command.system, command.id);
        self.release(command);
    }
}
