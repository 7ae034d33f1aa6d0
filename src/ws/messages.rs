//! WebSocket message types: outbound commands and inbound frames.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::MessageId;
use crate::error::ClientError;

/// Discriminator (`type` field) of an inbound frame.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// First frame of the handshake.
    AuthRequired,
    /// Token accepted.
    AuthOk,
    /// Token rejected.
    AuthInvalid,
    /// Reply to a command or subscription request.
    Result,
    /// Event for a standing subscription.
    Event,
    /// Reply to a `ping` command.
    Pong,
    /// Anything this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Error object carried by a failed `result` frame.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ServerErrorBody {
    /// Server error code (e.g. `not_found`).
    #[serde(default)]
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

impl From<ServerErrorBody> for ClientError {
    fn from(body: ServerErrorBody) -> Self {
        let message = if body.message.is_empty() {
            "unknown error".to_string()
        } else {
            body.message
        };
        Self::Server {
            code: body.code,
            message,
        }
    }
}

/// Any server-to-client frame.
///
/// Only the fields relevant to the frame's [`MessageType`] are populated.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    /// Correlation ID; absent on handshake frames.
    #[serde(default)]
    pub id: Option<MessageId>,
    /// Frame discriminator.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Success flag of a `result` frame.
    #[serde(default)]
    pub success: bool,
    /// Payload of a successful `result` frame.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error of a failed `result` frame.
    #[serde(default)]
    pub error: Option<ServerErrorBody>,
    /// Payload of an `event` frame.
    #[serde(default)]
    pub event: Option<Value>,
    /// Reason given by `auth_invalid`.
    #[serde(default)]
    pub message: Option<String>,
}

impl InboundMessage {
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the frame is not a JSON object with a
    /// `type` field.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Converts a `result` frame into the value or error its caller sees.
    pub fn into_reply(self) -> Result<Value, ClientError> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_default().into())
        }
    }

    /// Takes the event payload, defaulting to an empty object.
    #[must_use]
    pub fn into_event(self) -> Value {
        self.event.unwrap_or_else(|| Value::Object(Map::new()))
    }
}

/// Keys the client owns in every outbound command.
const RESERVED_KEYS: [&str; 2] = ["id", "type"];

/// An outbound command: a type plus arbitrary extra fields.
///
/// ```
/// use hab_client::ws::Command;
///
/// let cmd = Command::new("config/area_registry/create")
///     .param("name", "Kitchen")
///     .param("icon", "mdi:stove");
/// assert_eq!(cmd.command_type(), "config/area_registry/create");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    command_type: String,
    params: Map<String, Value>,
}

impl Command {
    /// Creates a command with no parameters.
    #[must_use]
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            params: Map::new(),
        }
    }

    /// Adds one field. `id` and `type` are ignored; the client sets them.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !RESERVED_KEYS.contains(&key.as_str()) {
            self.params.insert(key, value.into());
        }
        self
    }

    /// Adds a field only when `value` is `Some`.
    #[must_use]
    pub fn param_opt(self, key: impl Into<String>, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(v) => self.param(key, v),
            None => self,
        }
    }

    /// Merges a map of extra fields, later keys overwriting earlier ones.
    #[must_use]
    pub fn params(self, extra: Map<String, Value>) -> Self {
        extra
            .into_iter()
            .fold(self, |cmd, (key, value)| cmd.param(key, value))
    }

    /// Returns the command type.
    #[must_use]
    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    /// Returns the extra fields.
    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Builds the wire object `{id, type, ...params}`.
    #[must_use]
    pub fn into_message(self, id: MessageId) -> Value {
        let mut message = Map::with_capacity(self.params.len() + 2);
        message.insert("id".to_string(), Value::from(id.get()));
        message.insert("type".to_string(), Value::String(self.command_type));
        message.extend(self.params);
        Value::Object(message)
    }
}

/// Builds the `auth` frame sent during the handshake.
#[must_use]
pub fn auth_message(token: &str) -> Value {
    serde_json::json!({
        "type": "auth",
        "access_token": token,
    })
}

/// Builds a `subscribe_events` command, optionally filtered by event type.
#[must_use]
pub fn subscribe_events(event_type: Option<&str>) -> Command {
    Command::new("subscribe_events").param_opt("event_type", event_type)
}

/// Builds an `unsubscribe_events` command for the given subscription.
#[must_use]
pub fn unsubscribe_events(subscription: MessageId) -> Command {
    Command::new("unsubscribe_events").param("subscription", subscription.get())
}
