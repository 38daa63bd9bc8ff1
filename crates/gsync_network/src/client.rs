//! Connection client — one outbound WebSocket session with automatic
//! reconnection.
//!
//! A single session task owns the socket's read half and drives the
//! reconnect state machine as a plain loop:
//!
//! ```text
//! Connecting ──ok──▶ Connected ──lost──▶ Reconnecting ──ok──▶ Connected
//!     │                  │                    │
//!     └──err──▶ Reconnecting   disconnect()   └──attempts exhausted──▶ Disconnected
//! ```
//!
//! The delay between attempts is fixed. When the attempt budget runs out the
//! task emits [`ClientEvent::ReconnectExhausted`] once and exits; only a new
//! [`ConnectionClient::connect`] call (with a fresh counter) starts over.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::SplitStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::connection::{
    ConnectionContext, ConnectionId, Keepalive, KeepaliveConfig, KeepaliveEvent, PeerConnection,
};
use crate::error::NetworkError;
use crate::message::Message;
use crate::router::MessageRouter;

type ClientWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on a single dial, so an unresponsive host cannot stall the
/// reconnect loop on the OS connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of the outbound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Notifications emitted by the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A dial succeeded.
    Connected { remote_addr: SocketAddr },
    /// An established session was lost.
    Disconnected,
    /// About to wait and redial.
    Reconnecting { attempt: u32, max: u32 },
    /// The attempt budget is spent; the client stays disconnected.
    ReconnectExhausted { attempts: u32 },
}

/// Reconnection policy and session liveness limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub keepalive: KeepaliveConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for ClientConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
            keepalive: KeepaliveConfig::from(config),
        }
    }
}

/// State shared between the handle and its session task.
struct Shared {
    state: Mutex<ClientState>,
    attempts: AtomicU32,
    connection: Mutex<Option<Arc<PeerConnection>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl Shared {
    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn take_connection(&self) -> Option<Arc<PeerConnection>> {
        self.connection.lock().take()
    }
}

/// Maintains one outbound connection to a peer's server.
pub struct ConnectionClient {
    config: ClientConfig,
    router: Arc<MessageRouter>,
    shared: Arc<Shared>,
    target: Option<String>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    session: Option<JoinHandle<()>>,
}

impl ConnectionClient {
    pub fn new(config: ClientConfig, router: Arc<MessageRouter>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            router,
            shared: Arc::new(Shared {
                state: Mutex::new(ClientState::Disconnected),
                attempts: AtomicU32::new(0),
                connection: Mutex::new(None),
                events,
            }),
            target: None,
            shutdown_tx: None,
            session: None,
        }
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Reconnect attempts made since the last successful dial.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }

    /// Remote address of the live connection, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared
            .connection
            .lock()
            .as_ref()
            .map(|conn| conn.remote_addr())
    }

    /// The `ws://` URL most recently passed to [`connect`](Self::connect).
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Whether a session task is still looking after the connection, either
    /// connected or between reconnect attempts. `false` before the first
    /// `connect`, after `disconnect`, and once the retry budget is spent.
    pub fn has_session(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_finished())
    }

    /// Receive session notifications. Only events emitted after the call are
    /// delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Dial `addr` (`host:port` or a `ws://` URL) and start the session task.
    ///
    /// Returns the outcome of the first dial. Whether it succeeds or not the
    /// session task keeps the connection up from then on, redialing within
    /// the attempt budget. Any existing session is torn down first.
    pub async fn connect(&mut self, addr: &str) -> Result<(), NetworkError> {
        let url = ws_url(addr)?;
        self.disconnect().await;

        self.shared.attempts.store(0, Ordering::Release);
        self.shared.set_state(ClientState::Connecting);
        self.target = Some(url.clone());
        info!("Connecting to {url}");

        let first = dial(&url).await;
        let (initial, result) = match first {
            Ok((ws, remote_addr)) => (
                Some(attach(&self.shared, ws, remote_addr, &self.config.keepalive)),
                Ok(()),
            ),
            Err(e) => {
                warn!("Initial connection to {url} failed: {e}");
                (None, Err(e))
            }
        };

        let (shutdown_tx, shutdown) = broadcast::channel(1);
        let session = tokio::spawn(run_session(
            url,
            initial,
            self.config,
            Arc::clone(&self.router),
            Arc::clone(&self.shared),
            shutdown,
        ));
        self.shutdown_tx = Some(shutdown_tx);
        self.session = Some(session);

        result
    }

    /// Send a message on the live connection.
    ///
    /// A write failure marks the client disconnected; the session task
    /// notices the broken socket and starts reconnecting.
    pub async fn send(&self, message: &Message) -> Result<(), NetworkError> {
        if !self.is_connected() {
            return Err(NetworkError::NotConnected);
        }
        let conn = self
            .shared
            .connection
            .lock()
            .clone()
            .ok_or(NetworkError::NotConnected)?;

        conn.send(message).await.inspect_err(|e| {
            warn!("Send to {} failed: {e}", conn.remote_addr());
            self.shared.set_state(ClientState::Disconnected);
        })
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub async fn disconnect(&mut self) {
        let was_connected = self.is_connected();

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(session) = self.session.take() {
            let _ = session.await;
        }
        if let Some(conn) = self.shared.take_connection() {
            conn.close().await;
        }

        self.shared.set_state(ClientState::Disconnected);
        if was_connected {
            info!("Disconnected from peer");
            self.shared.emit(ClientEvent::Disconnected);
        }
    }
}

/// Why a receive loop ended.
enum SessionEnd {
    /// The transport failed or the peer closed.
    Lost,
    /// `disconnect()` was called.
    Shutdown,
}

async fn run_session(
    url: String,
    initial: Option<SplitStream<ClientWsStream>>,
    config: ClientConfig,
    router: Arc<MessageRouter>,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut pending = initial;

    loop {
        if let Some(stream) = pending.take() {
            let end = receive_loop(stream, &config.keepalive, &router, &shared, &mut shutdown).await;
            if let Some(conn) = shared.take_connection() {
                conn.close().await;
            }
            match end {
                SessionEnd::Shutdown => return,
                SessionEnd::Lost => {
                    info!("Connection to {url} lost");
                    shared.set_state(ClientState::Disconnected);
                    shared.emit(ClientEvent::Disconnected);
                }
            }
        }

        let attempts = shared.attempts.load(Ordering::Acquire);
        if attempts >= config.max_reconnect_attempts {
            warn!("Giving up on {url} after {attempts} reconnect attempts");
            shared.set_state(ClientState::Disconnected);
            shared.emit(ClientEvent::ReconnectExhausted { attempts });
            return;
        }

        let attempt = attempts + 1;
        shared.attempts.store(attempt, Ordering::Release);
        shared.set_state(ClientState::Reconnecting);
        shared.emit(ClientEvent::Reconnecting {
            attempt,
            max: config.max_reconnect_attempts,
        });
        info!(
            "Reconnecting to {url} in {:?} (attempt {attempt}/{})",
            config.reconnect_delay, config.max_reconnect_attempts
        );

        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown.recv() => return,
        }

        tokio::select! {
            result = dial(&url) => match result {
                Ok((ws, remote_addr)) => {
                    pending = Some(attach(&shared, ws, remote_addr, &config.keepalive));
                }
                Err(e) => debug!("Reconnect attempt {attempt} failed: {e}"),
            },
            _ = shutdown.recv() => return,
        }
    }
}

async fn receive_loop(
    mut stream: SplitStream<ClientWsStream>,
    keepalive: &KeepaliveConfig,
    router: &MessageRouter,
    shared: &Shared,
    shutdown: &mut broadcast::Receiver<()>,
) -> SessionEnd {
    let Some(conn) = shared.connection.lock().clone() else {
        return SessionEnd::Lost;
    };
    let ctx = ConnectionContext::new(Arc::clone(&conn));
    let mut liveness = Keepalive::new(keepalive);

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            event = liveness.next() => match event {
                KeepaliveEvent::Ping => {
                    if let Err(e) = conn.ping().await {
                        debug!("Ping to {} failed: {e}", ctx.remote_addr());
                        return SessionEnd::Lost;
                    }
                    continue;
                }
                KeepaliveEvent::Expired => {
                    warn!("Server {} stopped responding", ctx.remote_addr());
                    return SessionEnd::Lost;
                }
            },
            _ = shutdown.recv() => return SessionEnd::Shutdown,
        };
        liveness.observe();

        // A handler still running when `disconnect()` fires is abandoned.
        let dispatched = match frame {
            Some(Ok(WsMessage::Text(text))) => {
                router.dispatch_until(text.as_bytes(), ctx.clone(), shutdown).await
            }
            Some(Ok(WsMessage::Binary(bytes))) => {
                router.dispatch_until(&bytes, ctx.clone(), shutdown).await
            }
            Some(Ok(WsMessage::Close(_))) => {
                debug!("Server {} sent close", ctx.remote_addr());
                return SessionEnd::Lost;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Read error from {}: {e}", ctx.remote_addr());
                return SessionEnd::Lost;
            }
            None => return SessionEnd::Lost,
        };
        if dispatched.is_none() {
            return SessionEnd::Shutdown;
        }
    }
}

/// Install a freshly dialed socket as the live connection and hand back its
/// read half.
fn attach(
    shared: &Shared,
    ws: ClientWsStream,
    remote_addr: SocketAddr,
    keepalive: &KeepaliveConfig,
) -> SplitStream<ClientWsStream> {
    let (sink, stream) = ws.split();
    let conn = PeerConnection::from_client(
        ConnectionId::generate(),
        remote_addr,
        sink,
        keepalive.write_timeout,
    );
    info!("Connected to {remote_addr} as {}", conn.id());

    *shared.connection.lock() = Some(Arc::new(conn));
    shared.attempts.store(0, Ordering::Release);
    shared.set_state(ClientState::Connected);
    shared.emit(ClientEvent::Connected { remote_addr });
    stream
}

async fn dial(url: &str) -> Result<(ClientWsStream, SocketAddr), NetworkError> {
    let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| NetworkError::Timeout(CONNECT_TIMEOUT))?
        .map_err(|e| NetworkError::Transport(format!("Connect to {url} failed: {e}")))?;

    let remote_addr = match ws.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp.peer_addr()?,
        _ => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
    };
    Ok((ws, remote_addr))
}

/// Normalize `host:port` or a `ws://` URL into a WebSocket URL.
pub fn ws_url(addr: &str) -> Result<String, NetworkError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(NetworkError::InvalidAddress("empty address".into()));
    }
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        return Ok(addr.to_string());
    }
    if addr.contains("://") {
        return Err(NetworkError::InvalidAddress(format!(
            "unsupported scheme in {addr}"
        )));
    }
    Ok(format!("ws://{addr}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
