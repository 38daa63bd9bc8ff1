//! Connection handles shared by the server and client roles.
//!
//! A [`PeerConnection`] owns the write half of one WebSocket session. The read
//! half stays with the task running that session's receive loop, so writes
//! never wait on reads. Each connection has exactly one write path, which
//! keeps delivery FIFO per connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::SinkExt;
use futures::stream::SplitSink;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::message::Message;

/// Write half of a server-side WebSocket.
pub(crate) type ServerWsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Write half of a client-side WebSocket.
pub(crate) type ClientWsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Opaque identifier of a transport session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh short identifier.
    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self(id)
    }

    /// Create an id from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the session this host is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Accepted by our [`ConnectionServer`](crate::server::ConnectionServer).
    Server,
    /// Opened by our [`ConnectionClient`](crate::client::ConnectionClient).
    Client,
}

/// Liveness limits applied to every session, inbound or outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Interval between WebSocket pings. Zero disables pinging.
    pub ping_interval: Duration,
    /// Silence tolerated after a ping before the session is dropped.
    pub ping_timeout: Duration,
    /// Upper bound on writing one frame.
    pub write_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for KeepaliveConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

/// What a receive loop should do next for keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveEvent {
    /// Time to ping the peer.
    Ping,
    /// The peer stayed silent past the timeout after a ping.
    Expired,
}

/// Ping schedule and pong deadline for one receive loop.
///
/// Any inbound frame counts as a reply, so a busy session is never pinged
/// out. [`next`](Self::next) is cancel-safe and meant to sit in a `select!`
/// next to the socket read.
pub(crate) struct Keepalive {
    ticker: Option<Interval>,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Keepalive {
    pub(crate) fn new(config: &KeepaliveConfig) -> Self {
        let ticker = (!config.ping_interval.is_zero()).then(|| {
            let start = Instant::now() + config.ping_interval;
            let mut ticker = tokio::time::interval_at(start, config.ping_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        Self {
            ticker,
            timeout: config.ping_timeout,
            deadline: None,
        }
    }

    /// Record inbound traffic from the peer.
    pub(crate) fn observe(&mut self) {
        self.deadline = None;
    }

    /// Wait for the next keepalive action. Never resolves when disabled.
    pub(crate) async fn next(&mut self) -> KeepaliveEvent {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                _ = next_tick(&mut self.ticker) => {
                    if self.deadline.is_none() {
                        self.deadline = Some(Instant::now() + self.timeout);
                        return KeepaliveEvent::Ping;
                    }
                }
                _ = sleep_until_opt(deadline) => return KeepaliveEvent::Expired,
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The write side can be either a server-accepted or client-initiated socket.
enum PeerSink {
    Server(ServerWsSink),
    Client(ClientWsSink),
}

/// A live WebSocket session with one peer.
pub struct PeerConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    role: Role,
    sink: Mutex<PeerSink>,
    alive: AtomicBool,
    write_timeout: Duration,
}

impl PeerConnection {
    /// Wrap a server-accepted WebSocket sink.
    pub(crate) fn from_server(
        id: ConnectionId,
        remote_addr: SocketAddr,
        sink: ServerWsSink,
        write_timeout: Duration,
    ) -> Self {
        Self::with_sink(id, remote_addr, Role::Server, PeerSink::Server(sink), write_timeout)
    }

    /// Wrap a client-initiated WebSocket sink.
    pub(crate) fn from_client(
        id: ConnectionId,
        remote_addr: SocketAddr,
        sink: ClientWsSink,
        write_timeout: Duration,
    ) -> Self {
        Self::with_sink(id, remote_addr, Role::Client, PeerSink::Client(sink), write_timeout)
    }

    fn with_sink(
        id: ConnectionId,
        remote_addr: SocketAddr,
        role: Role,
        sink: PeerSink,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            remote_addr,
            role,
            sink: Mutex::new(sink),
            alive: AtomicBool::new(true),
            write_timeout,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the transport is still believed to be open.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the connection dead. Returns `true` only for the first call.
    pub(crate) fn mark_closed(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Serialize and write a message as one text frame.
    ///
    /// A write failure, or a write that does not finish within the write
    /// timeout, marks the connection dead; removal from any tracking
    /// structure is left to the owner.
    pub async fn send(&self, message: &Message) -> Result<(), NetworkError> {
        let json = message.to_json()?;
        self.write_frame(WsMessage::Text(json.into())).await
    }

    /// Write a WebSocket ping frame.
    pub(crate) async fn ping(&self) -> Result<(), NetworkError> {
        self.write_frame(WsMessage::Ping(Default::default())).await
    }

    async fn write_frame(&self, frame: WsMessage) -> Result<(), NetworkError> {
        if !self.is_alive() {
            return Err(NetworkError::Transport(format!(
                "Connection {} is closed",
                self.id
            )));
        }

        // The lock wait counts against the timeout: a writer stuck behind
        // a stalled peer must not queue forever either.
        let write = async {
            let mut sink = self.sink.lock().await;
            match &mut *sink {
                PeerSink::Server(sink) => sink.send(frame).await,
                PeerSink::Client(sink) => sink.send(frame).await,
            }
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_closed();
                Err(NetworkError::Transport(format!("Send error: {e}")))
            }
            Err(_) => {
                self.mark_closed();
                debug!("Write to {} timed out after {:?}", self.id, self.write_timeout);
                Err(NetworkError::Timeout(self.write_timeout))
            }
        }
    }

    /// Close the connection gracefully. Idempotent; close errors are ignored
    /// and a peer that stopped reading cannot hold this up past the write
    /// timeout.
    pub async fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        debug!("Closing connection {} ({})", self.id, self.remote_addr);
        let goodbye = async {
            let mut sink = self.sink.lock().await;
            match &mut *sink {
                PeerSink::Server(sink) => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                }
                PeerSink::Client(sink) => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                }
            }
        };
        if tokio::time::timeout(self.write_timeout, goodbye).await.is_err() {
            debug!("Close handshake with {} timed out", self.id);
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("role", &self.role)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Handed to message handlers so they can identify and reply to the sender.
#[derive(Clone)]
pub struct ConnectionContext {
    connection: Option<Arc<PeerConnection>>,
    id: ConnectionId,
    remote_addr: SocketAddr,
    role: Role,
}

impl ConnectionContext {
    /// Context bound to a live connection.
    pub fn new(connection: Arc<PeerConnection>) -> Self {
        Self {
            id: connection.id().clone(),
            remote_addr: connection.remote_addr(),
            role: connection.role(),
            connection: Some(connection),
        }
    }

    /// Context with no transport behind it; replies fail with
    /// [`NetworkError::NotConnected`]. Used for local dispatch and tests.
    pub fn detached(id: ConnectionId, remote_addr: SocketAddr, role: Role) -> Self {
        Self {
            connection: None,
            id,
            remote_addr,
            role,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Send a message back to the peer this context belongs to.
    pub async fn reply(&self, message: &Message) -> Result<(), NetworkError> {
        match &self.connection {
            Some(conn) => conn.send(message).await,
            None => Err(NetworkError::NotConnected),
        }
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("role", &self.role)
            .field("attached", &self.connection.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
