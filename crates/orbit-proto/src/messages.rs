//! Hub protocol message definitions.
//!
//! Every message on the hub connection is one JSON object whose `type`
//! field discriminates it. [`HubMessage`] covers what the hub sends us,
//! [`OutboundMessage`] covers what the gateway sends the hub.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::{Command, CommandId, CommandState};
use crate::error::ProtoError;

/// Milliseconds per minute, the unit hub rate limits are expressed against.
const ONE_MINUTE_MS: f64 = 60_000.0;

/// Default event message when a system sends none.
pub const DEFAULT_EVENT_MESSAGE: &str = "No message description received at gateway";

/// Default event type when a system sends none.
pub const DEFAULT_EVENT_TYPE: &str = "Gateway Event";

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Rate limit notice from the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum messages per minute.
    pub rate: f64,
    /// Seconds to wait before sending again.
    pub retry_after: f64,
    /// Human-readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RateLimit {
    /// Minimum gap between sends implied by `rate`, `floor(60000ms / rate)`.
    ///
    /// Returns `None` when the rate is not a positive finite number.
    #[must_use]
    pub fn min_interval(&self) -> Option<Duration> {
        if self.rate.is_finite() && self.rate > 0.0 {
            Some(Duration::from_millis((ONE_MINUTE_MS / self.rate).floor() as u64))
        } else {
            None
        }
    }

    /// Cool-down period requested by the hub.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        if self.retry_after.is_finite() && self.retry_after > 0.0 {
            Duration::from_secs_f64(self.retry_after)
        } else {
            Duration::ZERO
        }
    }
}

/// Messages sent from the hub to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Handshake greeting; outbound traffic may flow after this.
    Hello(Value),
    /// Slow down.
    RateLimit(RateLimit),
    /// A new command for one of our systems.
    Command(Command),
    /// Cancel a previously sent command.
    Cancel {
        /// Id of the command to cancel.
        id: CommandId,
    },
    /// The hub rejected something; the session needs a new handshake.
    Error(Value),
    /// A ground-station transit is expected.
    Transit(Value),
    /// A blob was received by the hub.
    ReceivedBlob(Value),
    /// All blob data for a transit has been delivered.
    BlobDataFinished(Value),
}

impl HubMessage {
    /// Classify a raw hub message.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON, has no `type`, names an
    /// unknown type, or lacks a field its type requires.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        let raw: Value = serde_json::from_str(json)?;
        Self::from_value(raw)
    }

    /// Classify an already-parsed hub message.
    ///
    /// # Errors
    ///
    /// See [`HubMessage::from_json`].
    pub fn from_value(raw: Value) -> Result<Self, ProtoError> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtoError::MissingField("type"))?
            .to_string();

        match kind.as_str() {
            "hello" => Ok(Self::Hello(raw)),
            "rate_limit" => {
                // Older hubs put the numbers at the top level.
                let body = raw.get("rate_limit").cloned().unwrap_or(raw);
                Ok(Self::RateLimit(serde_json::from_value(body)?))
            }
            "command" => {
                let command = raw
                    .get("command")
                    .cloned()
                    .ok_or(ProtoError::MissingField("command"))?;
                Ok(Self::Command(serde_json::from_value(command)?))
            }
            "cancel" => {
                let id = raw
                    .get("command")
                    .and_then(|c| c.get("id"))
                    .and_then(Value::as_u64)
                    .ok_or(ProtoError::MissingField("command.id"))?;
                Ok(Self::Cancel { id })
            }
            "error" => Ok(Self::Error(raw)),
            "transit" => Ok(Self::Transit(raw)),
            "received_blob" => Ok(Self::ReceivedBlob(raw)),
            "blob_data_finished" => Ok(Self::BlobDataFinished(raw)),
            _ => Err(ProtoError::UnknownMessageType(kind)),
        }
    }

    /// Wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::RateLimit(_) => "rate_limit",
            Self::Command(_) => "command",
            Self::Cancel { .. } => "cancel",
            Self::Error(_) => "error",
            Self::Transit(_) => "transit",
            Self::ReceivedBlob(_) => "received_blob",
            Self::BlobDataFinished(_) => "blob_data_finished",
        }
    }
}

/// One telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// System that produced the sample.
    pub system: String,
    /// Subsystem within the system.
    pub subsystem: String,
    /// Metric name.
    pub metric: String,
    /// Sample value.
    pub value: Value,
    /// Epoch milliseconds; filled with the receive time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Measurement {
    /// Create a measurement without a timestamp.
    #[must_use]
    pub fn new(
        system: impl Into<String>,
        subsystem: impl Into<String>,
        metric: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            system: system.into(),
            subsystem: subsystem.into(),
            metric: metric.into(),
            value: value.into(),
            timestamp: None,
        }
    }
}

/// Severity of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    /// Normal operation.
    #[default]
    Nominal,
    /// Debug detail.
    Debug,
    /// Something looks off.
    Warning,
    /// Something failed.
    Error,
    /// Something failed badly.
    Critical,
}

/// An event reported to the hub.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    /// Associated command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    /// Debug detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
    /// Severity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<EventLevel>,
    /// Event message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// System associated with the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Event type description.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl Event {
    /// Create an event with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Set the level.
    #[must_use]
    pub const fn with_level(mut self, level: EventLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Set the system.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Fill the fields the hub requires with their defaults.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.message
            .get_or_insert_with(|| DEFAULT_EVENT_MESSAGE.to_string());
        self.level.get_or_insert(EventLevel::Nominal);
        self.timestamp.get_or_insert_with(now_millis);
        self.event_type
            .get_or_insert_with(|| DEFAULT_EVENT_TYPE.to_string());
        self
    }
}

/// Command definitions for one system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinitions {
    /// System the definitions belong to.
    pub system: String,
    /// Opaque definitions document.
    pub definitions: Value,
}

/// File listing for one system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileList {
    /// System the files live on.
    pub system: String,
    /// Opaque file descriptors.
    pub files: Value,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Messages sent from the gateway to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A command moved to a new state.
    CommandUpdate {
        /// The command object, always including `id` and `state`.
        command: Map<String, Value>,
    },
    /// Telemetry samples.
    Measurements {
        /// Samples, each with a timestamp.
        measurements: Vec<Measurement>,
    },
    /// Events.
    Event {
        /// Events, each with defaults filled.
        events: Vec<Event>,
    },
    /// Command definitions for a system.
    CommandDefinitionsUpdate {
        /// The definitions.
        command_definitions: CommandDefinitions,
    },
    /// File listing for a system.
    FileList {
        /// The listing.
        file_list: FileList,
    },
    /// Binary data to uplink through the hub.
    TransmitBlob {
        /// Base64-encoded blob.
        blob: String,
        /// Caller-provided metadata, flattened into the envelope.
        #[serde(flatten)]
        metadata: Map<String, Value>,
    },
}

impl OutboundMessage {
    /// Build a command update. `id` and `state` override anything in `base`.
    #[must_use]
    pub fn command_update(id: CommandId, state: CommandState, base: Map<String, Value>) -> Self {
        let mut command = base;
        command.insert("id".to_string(), Value::from(id));
        command.insert("state".to_string(), Value::from(state.as_str()));
        Self::CommandUpdate { command }
    }

    /// Build a measurements message, stamping samples that carry no timestamp.
    #[must_use]
    pub fn measurements(measurements: Vec<Measurement>) -> Self {
        let now = now_millis();
        let measurements = measurements
            .into_iter()
            .map(|mut m| {
                m.timestamp.get_or_insert(now);
                m
            })
            .collect();
        Self::Measurements { measurements }
    }

    /// Build an events message with defaults filled.
    #[must_use]
    pub fn events(events: Vec<Event>) -> Self {
        Self::Event {
            events: events.into_iter().map(Event::with_defaults).collect(),
        }
    }

    /// Build a command definitions update.
    #[must_use]
    pub fn command_definitions(system: impl Into<String>, definitions: Value) -> Self {
        Self::CommandDefinitionsUpdate {
            command_definitions: CommandDefinitions {
                system: system.into(),
                definitions,
            },
        }
    }

    /// Build a file listing, stamped with now when `timestamp` is absent.
    #[must_use]
    pub fn file_list(system: impl Into<String>, files: Value, timestamp: Option<i64>) -> Self {
        Self::FileList {
            file_list: FileList {
                system: system.into(),
                files,
                timestamp: Some(timestamp.unwrap_or_else(now_millis)),
            },
        }
    }

    /// Build a blob uplink request.
    #[must_use]
    pub fn transmit_blob(blob: &[u8], metadata: Map<String, Value>) -> Self {
        Self::TransmitBlob {
            blob: BASE64.encode(blob),
            metadata,
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
