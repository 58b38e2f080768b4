//! Host extension points for the command lifecycle.
//!
//! Handlers that decide how a command advances receive a continuation
//! consumed by value, so every handler moves its command on exactly once.
//! Continuations post back onto the manager's event queue; the transition
//! they request runs after the handler returns.

use std::collections::HashMap;
use std::sync::Arc;

use orbit_channel::HostError;
use orbit_proto::{Command, CommandState};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::manager::{Event, GatewayHandle};

/// Checks a command when it arrives from the hub.
pub type Validator = Arc<dyn Fn(&Command) -> Result<(), HostError> + Send + Sync>;

/// Runs in `preparing_on_gateway` for commands of one type.
pub type PrepHandler = Arc<dyn Fn(&Command, PrepContinuation) + Send + Sync>;

/// Runs in `processing_on_gateway`.
pub type Processor = Arc<dyn Fn(&Command, ProcessContinuation) + Send + Sync>;

/// Observes a command entering `downlinking_from_system` or `cancel_on_gateway`.
pub type CommandHook = Arc<dyn Fn(&Command) + Send + Sync>;

/// Replaces the default action of one lifecycle state.
///
/// Receives the command, the errors carried by the transition and a handle
/// for driving further transitions. Returning `true` marks the transition
/// handled; returning `false` runs the default action as well.
pub type Listener = Arc<dyn Fn(&Command, &[String], &GatewayHandle) -> bool + Send + Sync>;

fn post(events: &mpsc::UnboundedSender<Event>, event: Event) {
    if events.send(event).is_err() {
        debug!("Gateway manager stopped; dropping continuation");
    }
}

fn transition(events: &mpsc::UnboundedSender<Event>, state: CommandState, command: Command, errors: Vec<String>) {
    post(
        events,
        Event::Transition {
            state: state.as_str().to_string(),
            command,
            errors,
        },
    );
}

/// How a [`PrepHandler`] advances its command.
#[derive(Debug)]
pub struct PrepContinuation {
    command: Command,
    events: mpsc::UnboundedSender<Event>,
}

impl PrepContinuation {
    pub(crate) fn new(command: Command, events: mpsc::UnboundedSender<Event>) -> Self {
        Self { command, events }
    }

    /// Preparation finished; route the command to its system.
    pub fn done(self) {
        transition(&self.events, CommandState::GatewayPrepComplete, self.command, Vec::new());
    }

    /// Preparation finished; `processor` post-processes this command
    /// instead of the processor registered for its type.
    pub fn done_with_processor(self, processor: Processor) {
        post(&self.events, Event::RegisterProcessor(self.command.id, processor));
        self.done();
    }

    /// The gateway handled the command itself.
    pub fn complete(mut self, output: Option<Value>) {
        if output.is_some() {
            self.command.output = output;
        }
        transition(&self.events, CommandState::Completed, self.command, Vec::new());
    }

    /// Preparation failed.
    pub fn fail(self, errors: Vec<String>) {
        transition(&self.events, CommandState::Failed, self.command, errors);
    }
}

/// How a [`Processor`] advances its command.
#[derive(Debug)]
pub struct ProcessContinuation {
    command: Command,
    events: mpsc::UnboundedSender<Event>,
}

impl ProcessContinuation {
    pub(crate) fn new(command: Command, events: mpsc::UnboundedSender<Event>) -> Self {
        Self { command, events }
    }

    /// Processing finished.
    pub fn done(self) {
        transition(&self.events, CommandState::CompleteOnGateway, self.command, Vec::new());
    }

    /// Processing finished with output for the hub.
    pub fn done_with_output(mut self, output: Value) {
        self.command.output = Some(output);
        self.done();
    }

    /// Processing failed.
    pub fn fail(self, errors: Vec<String>) {
        transition(&self.events, CommandState::Failed, self.command, errors);
    }
}

/// Handlers installed while configuring the manager.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) validator: Option<Validator>,
    pub(crate) validators_by_type: HashMap<String, Validator>,
    pub(crate) prep_handlers: HashMap<String, PrepHandler>,
    pub(crate) processors: HashMap<String, Processor>,
    pub(crate) downlink_handlers: HashMap<String, CommandHook>,
    pub(crate) cancel_handler: Option<CommandHook>,
}

impl Hooks {
    /// Run the type validator, falling back to the general one.
    pub(crate) fn validate(&self, command: &Command) -> Result<(), HostError> {
        match self
            .validators_by_type
            .get(&command.command_type)
            .or(self.validator.as_ref())
        {
            Some(validator) => validator(command),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("validator", &self.validator.is_some())
            .field("validators_by_type", &self.validators_by_type.keys().collect::<Vec<_>>())
            .field("prep_handlers", &self.prep_handlers.keys().collect::<Vec<_>>())
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("downlink_handlers", &self.downlink_handlers.keys().collect::<Vec<_>>())
            .field("cancel_handler", &self.cancel_handler.is_some())
            .finish()
    }
}
