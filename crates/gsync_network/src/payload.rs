//! Typed payloads for the built-in and application message types.
//!
//! The transport treats payload fields as opaque; these helpers give callers
//! a typed way to build and read the handful of types the application uses.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;
use crate::error::NetworkError;
use crate::message::{Message, MessageKind};

/// A payload bound to one message type.
pub trait Payload: Serialize + DeserializeOwned {
    /// The message type this payload travels as.
    fn kind() -> MessageKind;

    /// Wrap the payload in a message of its type.
    fn to_message(&self) -> Result<Message, NetworkError> {
        Ok(Message::with_payload(Self::kind(), self)?)
    }

    /// Read the payload back out of a message, checking its type first.
    fn from_message(message: &Message) -> Result<Self, NetworkError> {
        let expected = Self::kind();
        if message.kind != expected {
            return Err(NetworkError::UnexpectedKind {
                expected: expected.to_string(),
                actual: message.kind.to_string(),
            });
        }
        Ok(message.payload()?)
    }
}

// ---------------------------------------------------------------------------
// Built-in
// ---------------------------------------------------------------------------

/// Listening address reported in the welcome message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
}

/// Sent by the server as the first frame of every accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Id the server assigned to this connection.
    pub client_id: ConnectionId,
    pub server_info: ServerInfo,
}

impl Payload for Welcome {
    fn kind() -> MessageKind {
        MessageKind::ConnectionEstablished
    }
}

/// Reply to a `ping`. Carries no fields beyond the timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {}

impl Payload for Pong {
    fn kind() -> MessageKind {
        MessageKind::Pong
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Clipboard content pushed to peers.
///
/// `content` is ciphertext produced by the encryption layer and `checksum`
/// is that layer's digest of the plaintext; both are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardSync {
    pub content: String,
    #[serde(default)]
    pub checksum: String,
}

impl ClipboardSync {
    pub fn new(content: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            checksum: checksum.into(),
        }
    }
}

impl Payload for ClipboardSync {
    fn kind() -> MessageKind {
        MessageKind::ClipboardSync
    }
}

/// A recognized gesture forwarded to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GestureCommand {
    pub gesture: String,
}

impl GestureCommand {
    pub fn new(gesture: impl Into<String>) -> Self {
        Self {
            gesture: gesture.into(),
        }
    }
}

impl Payload for GestureCommand {
    fn kind() -> MessageKind {
        MessageKind::GestureCommand
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
