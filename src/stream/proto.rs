use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Type tag of chat messages, inbound and outbound.
pub const MESSAGE: &str = "message";
/// First event sent by the service once the stream is live.
pub const HELLO: &str = "hello";
/// Sent by the service before it drops the connection.
pub const GOODBYE: &str = "goodbye";
/// Service-side error report carried on the stream.
pub const ERROR: &str = "error";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const USER_TYPING: &str = "user_typing";
pub const PRESENCE_CHANGE: &str = "presence_change";

/// Failure annotation carried inside an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventError {
    #[serde(default)]
    pub code: i64,
    #[serde(rename = "msg", default)]
    pub message: String,
}

/// Envelope for every frame on the stream.
///
/// Only the minimal envelope is modelled. Keys outside it are kept in
/// `extra` so handlers can read payload details without the SDK knowing
/// their shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub id: u64,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub reply_to: i64,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "String::is_empty"
    )]
    pub channel: String,
    #[serde(
        rename = "ts",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "String::is_empty"
    )]
    pub timestamp: String,
    #[serde(
        rename = "user",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "String::is_empty"
    )]
    pub sender: String,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "String::is_empty"
    )]
    pub text: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Event {
    /// Builds an outbound chat message for `channel`.
    pub fn message(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            event_type: MESSAGE.to_string(),
            channel: channel.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    /// Builds an event carrying only a type tag.
    pub fn typed(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Self::default()
        }
    }

    /// True when this event answers a previously sent outbound id.
    pub fn is_reply(&self) -> bool {
        self.reply_to != 0
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encodes the event as JSON.
    ///
    /// `extra` entries that collide with envelope keys are left out, so the
    /// modelled fields (notably `id` and `type`) always win.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        if self.extra.keys().any(|key| is_envelope_key(key)) {
            let mut event = self.clone();
            event.extra.retain(|key, _| !is_envelope_key(key));
            return serde_json::to_string(&event);
        }
        serde_json::to_string(self)
    }
}

const ENVELOPE_KEYS: [&str; 8] = [
    "id", "type", "error", "reply_to", "channel", "ts", "user", "text",
];

fn is_envelope_key(key: &str) -> bool {
    ENVELOPE_KEYS.contains(&key)
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

// Non-string values (eg, object-valued `channel` on channel_created) read
// as empty.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        _ => Ok(String::new()),
    }
}
