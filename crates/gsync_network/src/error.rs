//! Network error types.

use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::ConnectionId;

/// Errors that can occur in the gsync_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A listening socket could not be bound. Fatal to `start()`.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The server does not track a connection with this id.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The client has no live connection to send on.
    #[error("Not connected to a peer")]
    NotConnected,

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A typed payload was decoded from a message of another type.
    #[error("Expected a {expected} message, got {actual}")]
    UnexpectedKind { expected: String, actual: String },

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A peer address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The component is not running.
    #[error("Not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
