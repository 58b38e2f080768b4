//! Messages arriving from systems.

use serde_json::Value;

use crate::command::Command;
use crate::error::ProtoError;
use crate::messages::{CommandDefinitions, Event, FileList, Measurement};

/// A message a system wrote to the gateway's receive sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemMessage {
    /// The system moved a command to a new state.
    CommandUpdate(Command),
    /// The system published its command definitions.
    CommandDefinitions(CommandDefinitions),
    /// One or more events.
    Events(Vec<Event>),
    /// The system's file listing.
    FileList(FileList),
    /// Metadata for a downlinked file; forwarded to the hub as-is.
    FileMetadataUpdate(Value),
    /// Telemetry samples.
    Measurements(Vec<Measurement>),
}

impl SystemMessage {
    /// Classify a system message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message has no `type`, names a type systems
    /// do not send, or lacks the body its type requires.
    pub fn from_value(raw: Value) -> Result<Self, ProtoError> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtoError::MissingField("type"))?;

        match kind {
            "command_update" => {
                let command = body(&raw, "command")?;
                Ok(Self::CommandUpdate(serde_json::from_value(command)?))
            }
            "command_definitions_update" => {
                let defs = body(&raw, "command_definitions")?;
                Ok(Self::CommandDefinitions(serde_json::from_value(defs)?))
            }
            "event" => {
                let events = match body(&raw, "event")? {
                    list @ Value::Array(_) => serde_json::from_value(list)?,
                    single => vec![serde_json::from_value(single)?],
                };
                Ok(Self::Events(events))
            }
            "file_list" => {
                let list = body(&raw, "file_list")?;
                Ok(Self::FileList(serde_json::from_value(list)?))
            }
            "file_metadata_update" => {
                body(&raw, "downlinked_file")?;
                Ok(Self::FileMetadataUpdate(raw))
            }
            "measurements" => {
                let measurements = body(&raw, "measurements")?;
                Ok(Self::Measurements(serde_json::from_value(measurements)?))
            }
            other => Err(ProtoError::UnknownMessageType(other.to_string())),
        }
    }

    /// Wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CommandUpdate(_) => "command_update",
            Self::CommandDefinitions(_) => "command_definitions_update",
            Self::Events(_) => "event",
            Self::FileList(_) => "file_list",
            Self::FileMetadataUpdate(_) => "file_metadata_update",
            Self::Measurements(_) => "measurements",
        }
    }
}

fn body(raw: &Value, field: &'static str) -> Result<Value, ProtoError> {
    match raw.get(field) {
        None | Some(Value::Null) => Err(ProtoError::MissingField(field)),
        Some(value) => Ok(value.clone()),
    }
}
