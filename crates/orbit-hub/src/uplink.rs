//! The outbound surface of the hub session.

use orbit_proto::{CommandId, CommandState, Event, Measurement, OutboundMessage};
use serde_json::{Map, Value};

use crate::error::{HubError, HubResult};

/// Everything the gateway sends to the hub goes through this trait.
///
/// Implementors provide [`HubUplink::transmit_raw`]; the helpers build the
/// hub's JSON envelopes on top of it. `HubSession` is the production
/// implementation; tests substitute a recorder.
pub trait HubUplink: Send + Sync {
    /// Queue one JSON frame for the hub.
    fn transmit_raw(&self, frame: String) -> HubResult<()>;

    /// Start (or refresh) the hub connection.
    fn connect(&self) -> HubResult<()> {
        Ok(())
    }

    /// Send a structured message.
    fn transmit(&self, message: &OutboundMessage) -> HubResult<()> {
        self.transmit_raw(message.to_json()?)
    }

    /// Send an arbitrary JSON value, assumed to be a valid hub envelope.
    fn transmit_value(&self, value: &Value) -> HubResult<()> {
        self.transmit_raw(serde_json::to_string(value)?)
    }

    /// Send pre-encoded JSON bytes.
    fn transmit_bytes(&self, bytes: &[u8]) -> HubResult<()> {
        let frame = std::str::from_utf8(bytes)
            .map_err(|e| HubError::Encoding(format!("frame is not UTF-8: {e}")))?;
        self.transmit_raw(frame.to_string())
    }

    /// Report a command state change; `base` supplies extra command fields.
    fn transmit_command_update(
        &self,
        id: CommandId,
        state: CommandState,
        base: Map<String, Value>,
    ) -> HubResult<()> {
        self.transmit(&OutboundMessage::command_update(id, state, base))
    }

    /// Report a command as completed.
    fn complete_command(&self, id: CommandId, output: Option<Value>) -> HubResult<()> {
        let mut base = Map::new();
        if let Some(output) = output {
            base.insert("output".to_string(), output);
        }
        self.transmit_command_update(id, CommandState::Completed, base)
    }

    /// Report a command as failed.
    fn fail_command(&self, id: CommandId, errors: Vec<String>) -> HubResult<()> {
        let mut base = Map::new();
        base.insert("errors".to_string(), Value::from(errors));
        self.transmit_command_update(id, CommandState::Failed, base)
    }

    /// Report a command as cancelled.
    fn cancel_command(&self, id: CommandId) -> HubResult<()> {
        self.transmit_command_update(id, CommandState::Cancelled, Map::new())
    }

    /// Send events, filling defaults.
    fn transmit_events(&self, events: Vec<Event>) -> HubResult<()> {
        self.transmit(&OutboundMessage::events(events))
    }

    /// Send measurements, stamping missing timestamps.
    fn transmit_metrics(&self, measurements: Vec<Measurement>) -> HubResult<()> {
        self.transmit(&OutboundMessage::measurements(measurements))
    }

    /// Publish a system's command definitions.
    fn update_command_definitions(&self, system: &str, definitions: Value) -> HubResult<()> {
        self.transmit(&OutboundMessage::command_definitions(system, definitions))
    }

    /// Publish a system's file list.
    fn update_file_list(&self, system: &str, files: Value, timestamp: Option<i64>) -> HubResult<()> {
        self.transmit(&OutboundMessage::file_list(system, files, timestamp))
    }

    /// Ask the hub to uplink a blob.
    fn transmit_blob_for_uplink(&self, blob: &[u8], metadata: Map<String, Value>) -> HubResult<()> {
        self.transmit(&OutboundMessage::transmit_blob(blob, metadata))
    }
}
