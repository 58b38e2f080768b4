//! Commands and their lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtoError;

/// Hub-assigned command identifier.
pub type CommandId = u64;

/// Lifecycle state of a command.
///
/// The happy path runs from [`CommandState::ReceivedFromMt`] to
/// [`CommandState::Completed`]. [`CommandState::Failed`] and
/// [`CommandState::Cancelled`] are the other terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Received from the hub, not yet validated.
    ReceivedFromMt,
    /// Validated; a gateway-side handler may be preparing it.
    PreparingOnGateway,
    /// Gateway-side preparation finished.
    GatewayPrepComplete,
    /// Destination resolved; waiting for the system queue.
    ReadyForSystem,
    /// Being sent to the system.
    UplinkingToSystem,
    /// The system acknowledged receipt.
    AckedBySystem,
    /// The system is executing the command.
    ExecutingOnSystem,
    /// The system is sending results back.
    DownlinkingFromSystem,
    /// The system is finished with the command.
    DoneOnSystem,
    /// Gateway-side post-processing.
    ProcessingOnGateway,
    /// Gateway-side post-processing finished.
    CompleteOnGateway,
    /// Terminal success.
    Completed,
    /// Cancellation requested.
    CancelOnGateway,
    /// Terminal cancellation.
    Cancelled,
    /// Terminal failure.
    Failed,
}

impl CommandState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 15] = [
        Self::ReceivedFromMt,
        Self::PreparingOnGateway,
        Self::GatewayPrepComplete,
        Self::ReadyForSystem,
        Self::UplinkingToSystem,
        Self::AckedBySystem,
        Self::ExecutingOnSystem,
        Self::DownlinkingFromSystem,
        Self::DoneOnSystem,
        Self::ProcessingOnGateway,
        Self::CompleteOnGateway,
        Self::Completed,
        Self::CancelOnGateway,
        Self::Cancelled,
        Self::Failed,
    ];

    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReceivedFromMt => "received_from_mt",
            Self::PreparingOnGateway => "preparing_on_gateway",
            Self::GatewayPrepComplete => "gateway_prep_complete",
            Self::ReadyForSystem => "ready_for_system",
            Self::UplinkingToSystem => "uplinking_to_system",
            Self::AckedBySystem => "acked_by_system",
            Self::ExecutingOnSystem => "executing_on_system",
            Self::DownlinkingFromSystem => "downlinking_from_system",
            Self::DoneOnSystem => "done_on_system",
            Self::ProcessingOnGateway => "processing_on_gateway",
            Self::CompleteOnGateway => "complete_on_gateway",
            Self::Completed => "completed",
            Self::CancelOnGateway => "cancel_on_gateway",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Check if the state is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Check if the state lies between `uplinking_to_system` and
    /// `done_on_system` inclusive, i.e. the system owns the command.
    #[must_use]
    pub const fn is_on_system(&self) -> bool {
        matches!(
            self,
            Self::UplinkingToSystem
                | Self::AckedBySystem
                | Self::ExecutingOnSystem
                | Self::DownlinkingFromSystem
                | Self::DoneOnSystem
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandState {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ProtoError::UnknownState(s.to_string()))
    }
}

/// One directive from the hub to a system.
///
/// Fields the gateway does not interpret are kept in `extra` and written
/// back unchanged whenever the command is serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Hub-assigned identifier.
    pub id: CommandId,
    /// Command type, used to select gateway-side handlers.
    #[serde(rename = "type", default)]
    pub command_type: String,
    /// Destination system name.
    #[serde(default)]
    pub system: String,
    /// Opaque command arguments.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub fields: Value,
    /// Raw state name, as last reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Payload reported by the system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Output reported on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error reasons collected along the way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    /// Fields not interpreted by the gateway.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Command {
    /// Create a command with no fields.
    #[must_use]
    pub fn new(id: CommandId, command_type: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            id,
            command_type: command_type.into(),
            system: system.into(),
            fields: Value::Null,
            state: None,
            payload: None,
            output: None,
            errors: None,
            extra: Map::new(),
        }
    }

    /// Set the command fields.
    #[must_use]
    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = fields;
        self
    }

    /// Set the raw state name.
    #[must_use]
    pub fn with_state(mut self, state: CommandState) -> Self {
        self.state = Some(state.as_str().to_string());
        self
    }

    /// Parse the raw state name.
    ///
    /// # Errors
    ///
    /// Returns an error if no state is set or the name is not a lifecycle state.
    pub fn parsed_state(&self) -> Result<CommandState, ProtoError> {
        self.state
            .as_deref()
            .ok_or(ProtoError::MissingField("state"))?
            .parse()
    }

    /// Fold an update reported by a system into this command.
    ///
    /// Identity fields (`type`, `system`, `fields`) are only taken from the
    /// update when this command does not already carry them.
    pub fn merge_update(&mut self, update: Self) {
        if self.command_type.is_empty() {
            self.command_type = update.command_type;
        }
        if self.system.is_empty() {
            self.system = update.system;
        }
        if self.fields.is_null() {
            self.fields = update.fields;
        }
        if update.state.is_some() {
            self.state = update.state;
        }
        if update.payload.is_some() {
            self.payload = update.payload;
        }
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.errors.is_some() {
            self.errors = update.errors;
        }
        self.extra.extend(update.extra);
    }

    /// Serialize the command into a JSON object.
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(CommandState::ReceivedFromMt, "received_from_mt")]
    #[test_case(CommandState::GatewayPrepComplete, "gateway_prep_complete")]
    #[test_case(CommandState::DownlinkingFromSystem, "downlinking_from_system")]
    #[test_case(CommandState::CancelOnGateway, "cancel_on_gateway")]
    #[test_case(CommandState::Failed, "failed")]
    fn test_state_names(state: CommandState, name: &str) {
        assert_eq!(state.as_str(), name);
        assert_eq!(name.parse::<CommandState>().unwrap(), state);
        assert_eq!(serde_json::to_value(state).unwrap(), json!(name));
    }

    #[test]
    fn test_unknown_state_rejected() {
        let err = "teleporting".parse::<CommandState>().unwrap_err();
        assert!(matches!(err, ProtoError::UnknownState(s) if s == "teleporting"));
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = CommandState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                &CommandState::Completed,
                &CommandState::Cancelled,
                &CommandState::Failed
            ]
        );
    }

    #[test]
    fn test_on_system_window() {
        assert!(!CommandState::ReadyForSystem.is_on_system());
        assert!(CommandState::UplinkingToSystem.is_on_system());
        assert!(CommandState::DoneOnSystem.is_on_system());
        assert!(!CommandState::ProcessingOnGateway.is_on_system());
    }

    #[test]
    fn test_command_from_hub_json() {
        let cmd: Command = serde_json::from_value(json!({
            "id": 42,
            "type": "ping",
            "system": "sat-1",
            "fields": [{"name": "count", "value": 2}],
            "priority": "high"
        }))
        .unwrap();

        assert_eq!(cmd.id, 42);
        assert_eq!(cmd.command_type, "ping");
        assert_eq!(cmd.system, "sat-1");
        assert_eq!(cmd.fields[0]["value"], json!(2));
        assert_eq!(cmd.extra.get("priority"), Some(&json!("high")));
        assert!(cmd.state.is_none());
    }

    #[test]
    fn test_command_serialization_keeps_extra_fields() {
        let mut cmd = Command::new(7, "reboot", "sat-2");
        cmd.extra.insert("note".to_string(), json!("soon"));

        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["type"], json!("reboot"));
        assert_eq!(value["note"], json!("soon"));
        assert!(value.get("fields").is_none());
        assert!(value.get("errors").is_none());
    }

    #[test]
    fn test_merge_update_keeps_identity() {
        let mut tracked = Command::new(1, "ping", "sat-1").with_fields(json!([1]));
        let update: Command = serde_json::from_value(json!({
            "id": 1,
            "state": "executing_on_system",
            "payload": "raw bytes"
        }))
        .unwrap();

        tracked.merge_update(update);

        assert_eq!(tracked.system, "sat-1");
        assert_eq!(tracked.command_type, "ping");
        assert_eq!(tracked.fields, json!([1]));
        assert_eq!(tracked.parsed_state().unwrap(), CommandState::ExecutingOnSystem);
        assert_eq!(tracked.payload, Some(json!("raw bytes")));
    }

    #[test]
    fn test_parsed_state_missing() {
        let cmd = Command::new(1, "ping", "sat-1");
        assert!(matches!(
            cmd.parsed_state(),
            Err(ProtoError::MissingField("state"))
        ));
    }
}
