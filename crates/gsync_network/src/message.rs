//! Wire message protocol — one JSON object per frame, keyed by `type`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The declared type of a [`Message`], used as the dispatch key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    // ── Built-in ────────────────────────────────────────────────────
    /// Liveness probe; answered with [`MessageKind::Pong`].
    Ping,
    /// Liveness reply.
    Pong,
    /// Welcome sent once per accepted server-side connection.
    ConnectionEstablished,

    // ── Application ─────────────────────────────────────────────────
    /// Encrypted clipboard content pushed to peers.
    ClipboardSync,
    /// A recognized gesture forwarded to peers.
    GestureCommand,

    // ── Extensible ──────────────────────────────────────────────────
    /// Any other application-defined type.
    Other(String),
}

impl MessageKind {
    /// Return the string key used on the wire and for handler dispatch.
    pub fn dispatch_key(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::ConnectionEstablished => "connection_established",
            Self::ClipboardSync => "clipboard_sync",
            Self::GestureCommand => "gesture_command",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "connection_established" => Self::ConnectionEstablished,
            "clipboard_sync" => Self::ClipboardSync,
            "gesture_command" => Self::GestureCommand,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(name) => name,
            known => known.dispatch_key().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dispatch_key())
    }
}

/// A typed JSON message: a `type` discriminator, a timestamp and arbitrary
/// payload fields flattened alongside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The dispatch key.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// When the message was created. Defaults to receipt time if absent.
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Payload fields, opaque to the transport.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    /// Create a message with no payload fields.
    pub fn new(kind: impl Into<MessageKind>) -> Self {
        Self {
            kind: kind.into(),
            timestamp: Utc::now(),
            fields: Map::new(),
        }
    }

    /// Create a message whose fields are taken from a serializable payload.
    ///
    /// The payload must serialize to a JSON object. `type` and `timestamp`
    /// keys inside it are ignored.
    pub fn with_payload<T: Serialize>(
        kind: impl Into<MessageKind>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let mut message = Self::new(kind);
        match serde_json::to_value(payload)? {
            Value::Object(mut map) => {
                map.remove("type");
                map.remove("timestamp");
                message.fields = map;
            }
            Value::Null => {}
            other => {
                return Err(serde::ser::Error::custom(format!(
                    "message payload must be a JSON object, got {other}"
                )));
            }
        }
        Ok(message)
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// A `ping` message.
    pub fn ping() -> Self {
        Self::new(MessageKind::Ping)
    }

    /// A `pong` message.
    pub fn pong() -> Self {
        Self::new(MessageKind::Pong)
    }

    /// Look up a single payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Decode the payload fields into a typed structure.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    /// Serialize the message to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Deserialize a message from raw frame bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Accept RFC 3339 strings as well as numeric Unix seconds, which some
/// peers put in `timestamp`. Anything else falls back to receipt time: a
/// message with a valid `type` is never rejected over its timestamp.
fn lenient_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = Value::deserialize(d)?;
    Ok(parse_timestamp(&raw).unwrap_or_else(|| {
        if !raw.is_null() {
            tracing::debug!("Unparseable message timestamp {raw}, using receipt time");
        }
        Utc::now()
    }))
}

fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|naive| naive.and_utc())
            })
            .ok(),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() || secs.abs() > 1e14 {
                return None;
            }
            DateTime::from_timestamp_millis((secs * 1000.0) as i64)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
