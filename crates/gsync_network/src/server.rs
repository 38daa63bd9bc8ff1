//! Connection server — accepts inbound WebSocket sessions from peers.
//!
//! Each accepted socket gets its own task running a receive loop that feeds
//! the shared [`MessageRouter`]. The tracked connection map only ever holds
//! sessions whose transport has not reported closure: the receive loop removes
//! its entry when the socket errors or closes, and [`ConnectionServer::broadcast`]
//! removes any session whose write failed or timed out. Sessions that go
//! silent are pinged and dropped once the pong deadline passes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::connection::{
    ConnectionContext, ConnectionId, Keepalive, KeepaliveConfig, KeepaliveEvent, PeerConnection,
};
use crate::error::NetworkError;
use crate::message::Message;
use crate::payload::{Payload, ServerInfo, Welcome};
use crate::router::MessageRouter;

type ConnectionMap = Arc<RwLock<HashMap<ConnectionId, Arc<PeerConnection>>>>;

/// Upper bound on the WebSocket upgrade of an accepted socket.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a listening server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Accepts many peers, dispatches their messages and fans messages out.
pub struct ConnectionServer {
    listen_addr: SocketAddr,
    router: Arc<MessageRouter>,
    keepalive: KeepaliveConfig,
    connections: ConnectionMap,
    state: ServerState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl ConnectionServer {
    pub fn new(listen_addr: SocketAddr, router: Arc<MessageRouter>) -> Self {
        Self {
            listen_addr,
            router,
            keepalive: KeepaliveConfig::default(),
            connections: Arc::new(RwLock::new(HashMap::new())),
            state: ServerState::Stopped,
            local_addr: None,
            shutdown_tx: None,
            accept_task: None,
        }
    }

    /// Replace the ping and write limits applied to accepted sessions. Takes
    /// effect for connections accepted after the next `start`.
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ServerState::Running
    }

    /// The address actually bound, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Ids of all live connections.
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Bind the listening socket and start accepting. A bind failure is
    /// returned to the caller and leaves the server stopped. A no-op unless
    /// the server is stopped.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.state != ServerState::Stopped {
            return Ok(());
        }
        self.state = ServerState::Starting;

        let listener = match TcpListener::bind(self.listen_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.state = ServerState::Stopped;
                return Err(NetworkError::Bind {
                    addr: self.listen_addr,
                    source,
                });
            }
        };
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown) = broadcast::channel(1);
        let router = Arc::clone(&self.router);
        let connections = Arc::clone(&self.connections);
        let keepalive = self.keepalive;
        let conn_shutdown = shutdown_tx.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, peer_addr)) => {
                                tokio::spawn(handle_connection(
                                    stream,
                                    peer_addr,
                                    local_addr,
                                    keepalive,
                                    Arc::clone(&router),
                                    Arc::clone(&connections),
                                    conn_shutdown.subscribe(),
                                ));
                            }
                            Err(e) => {
                                error!("TCP accept failed: {e}");
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Accept loop shutting down");
                        break;
                    }
                }
            }
        });

        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.accept_task = Some(accept_task);
        self.state = ServerState::Running;
        info!("WebSocket server listening on {local_addr}");
        Ok(())
    }

    /// Close every connection, release the listener and return to `Stopped`.
    /// A no-op when already stopped.
    pub async fn stop(&mut self) {
        if self.state == ServerState::Stopped {
            return;
        }
        self.state = ServerState::Stopping;

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        let drained: Vec<Arc<PeerConnection>> = {
            let mut conns = self.connections.write().await;
            conns.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            conn.close().await;
        }

        self.local_addr = None;
        self.state = ServerState::Stopped;
        info!("WebSocket server stopped");
    }

    /// Send a message to one connection.
    ///
    /// A write failure is logged and returned; the connection's own receive
    /// loop takes care of removing it.
    pub async fn send(&self, id: &ConnectionId, message: &Message) -> Result<(), NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        let conn = self
            .connections
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| NetworkError::ConnectionNotFound(id.clone()))?;

        conn.send(message).await.inspect_err(|e| {
            warn!("Send to {id} failed: {e}");
        })
    }

    /// Send a message to every live connection except `exclude`. Returns the
    /// number of connections that accepted the write.
    ///
    /// Connections whose write fails or exceeds the write timeout are dropped
    /// from the tracked set once the sweep is over; they never prevent
    /// delivery to the others.
    pub async fn broadcast(
        &self,
        message: &Message,
        exclude: Option<&ConnectionId>,
    ) -> Result<usize, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }

        let targets: Vec<Arc<PeerConnection>> = self
            .connections
            .read()
            .await
            .values()
            .filter(|conn| Some(conn.id()) != exclude)
            .cloned()
            .collect();

        let results = futures::future::join_all(targets.iter().map(|conn| conn.send(message))).await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (conn, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Broadcast send to {} failed: {e}", conn.id());
                    failed.push(conn.id().clone());
                }
            }
        }

        if !failed.is_empty() {
            let mut conns = self.connections.write().await;
            for id in &failed {
                conns.remove(id);
            }
        }

        Ok(delivered)
    }
}

/// Run one accepted socket until it closes, goes silent, or the server stops.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    server_addr: SocketAddr,
    keepalive: KeepaliveConfig,
    router: Arc<MessageRouter>,
    connections: ConnectionMap,
    mut shutdown: broadcast::Receiver<()>,
) {
    let ws_stream = tokio::select! {
        result = tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)) => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!("WebSocket handshake failed for {peer_addr}: {e}");
                return;
            }
            Err(_) => {
                warn!("WebSocket handshake with {peer_addr} timed out");
                return;
            }
        },
        _ = shutdown.recv() => {
            debug!("Server stopping, dropping half-open socket from {peer_addr}");
            return;
        }
    };
    let (sink, mut stream) = ws_stream.split();

    let id = ConnectionId::generate();
    let conn = Arc::new(PeerConnection::from_server(
        id.clone(),
        peer_addr,
        sink,
        keepalive.write_timeout,
    ));
    connections.write().await.insert(id.clone(), Arc::clone(&conn));
    info!("Client {id} connected from {peer_addr}");

    let welcome = Welcome {
        client_id: id.clone(),
        server_info: ServerInfo {
            host: server_addr.ip().to_string(),
            port: server_addr.port(),
        },
    };
    match welcome.to_message() {
        Ok(msg) => {
            if let Err(e) = conn.send(&msg).await {
                warn!("Welcome to {id} failed: {e}");
            }
        }
        Err(e) => error!("Failed to encode welcome: {e}"),
    }

    let ctx = ConnectionContext::new(Arc::clone(&conn));
    let mut liveness = Keepalive::new(&keepalive);
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            event = liveness.next() => match event {
                KeepaliveEvent::Ping => {
                    if let Err(e) = conn.ping().await {
                        debug!("Ping to {id} failed: {e}");
                        break;
                    }
                    continue;
                }
                KeepaliveEvent::Expired => {
                    warn!("Client {id} stopped responding, dropping it");
                    break;
                }
            },
            _ = shutdown.recv() => break,
        };
        liveness.observe();

        let dispatched = match frame {
            Some(Ok(WsMessage::Text(text))) => {
                router.dispatch_until(text.as_bytes(), ctx.clone(), &mut shutdown).await
            }
            Some(Ok(WsMessage::Binary(bytes))) => {
                router.dispatch_until(&bytes, ctx.clone(), &mut shutdown).await
            }
            Some(Ok(WsMessage::Close(_))) => {
                debug!("Client {id} sent close");
                break;
            }
            // Pings are answered by tungstenite; pongs only refresh liveness.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Read error from {id}: {e}");
                break;
            }
            None => break,
        };
        if dispatched.is_none() {
            break;
        }
    }

    connections.write().await.remove(&id);
    conn.close().await;
    info!("Client {id} disconnected");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use futures::SinkExt;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    type TestClient = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<TcpStream>,
    >;

    async fn running_server() -> ConnectionServer {
        let mut server = ConnectionServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(MessageRouter::new()),
        );
        server.start().await.unwrap();
        server
    }

    async fn server_with(keepalive: KeepaliveConfig) -> ConnectionServer {
        let mut server = ConnectionServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(MessageRouter::new()),
        )
        .with_keepalive(keepalive);
        server.start().await.unwrap();
        server
    }

    fn limits(ping_ms: u64, pong_ms: u64, write_ms: u64) -> KeepaliveConfig {
        KeepaliveConfig {
            ping_interval: Duration::from_millis(ping_ms),
            ping_timeout: Duration::from_millis(pong_ms),
            write_timeout: Duration::from_millis(write_ms),
        }
    }

    async fn next_message(client: &mut TestClient) -> Message {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("read error");
            if let WsMessage::Text(text) = frame {
                return Message::from_json(&text).unwrap();
            }
        }
    }

    async fn connect(server: &ConnectionServer) -> (TestClient, ConnectionId) {
        let url = format!("ws://{}", server.local_addr().unwrap());
        let (mut client, _) = connect_async(url).await.unwrap();
        let welcome = next_message(&mut client).await;
        assert_eq!(welcome.kind, MessageKind::ConnectionEstablished);
        let welcome = Welcome::from_message(&welcome).unwrap();
        (client, welcome.client_id)
    }

    async fn wait_for_count(server: &ConnectionServer, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.connection_count().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection count never reached the expected value");
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let mut server = ConnectionServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(MessageRouter::new()),
        );
        assert_eq!(server.state(), ServerState::Stopped);
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);

        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.is_running());

        server.stop().await;
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = running_server().await;
        let taken = first.local_addr().unwrap();

        let mut second = ConnectionServer::new(taken, Arc::new(MessageRouter::new()));
        match second.start().await {
            Err(NetworkError::Bind { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("Expected Bind error, got {other:?}"),
        }
        assert_eq!(second.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_welcome_and_tracking() {
        let mut server = running_server().await;
        let (mut client, id) = connect(&server).await;
        assert_eq!(id.as_str().len(), 8);
        wait_for_count(&server, 1).await;
        assert_eq!(server.connection_ids().await, vec![id.clone()]);

        client.close(None).await.unwrap();
        wait_for_count(&server, 0).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let mut server = running_server().await;
        let (mut client, _) = connect(&server).await;

        let ping = Message::ping().to_json().unwrap();
        client.send(WsMessage::Text(ping.into())).await.unwrap();
        assert_eq!(next_message(&mut client).await.kind, MessageKind::Pong);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_targeted_send() {
        let mut server = running_server().await;
        let (mut a, id_a) = connect(&server).await;
        let (_b, _) = connect(&server).await;
        wait_for_count(&server, 2).await;

        let msg = Message::new("note").with_field("to", "a");
        server.send(&id_a, &msg).await.unwrap();
        let received = next_message(&mut a).await;
        assert_eq!(received.field("to"), Some(&serde_json::json!("a")));

        let missing = ConnectionId::from_string("missing0");
        assert!(matches!(
            server.send(&missing, &msg).await,
            Err(NetworkError::ConnectionNotFound(_))
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let mut server = running_server().await;
        let (mut a, id_a) = connect(&server).await;
        let (mut b, _) = connect(&server).await;
        let (mut c, _) = connect(&server).await;
        wait_for_count(&server, 3).await;

        let msg = Message::new("fanout").with_field("n", 1);
        let delivered = server.broadcast(&msg, Some(&id_a)).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(next_message(&mut b).await.kind.dispatch_key(), "fanout");
        assert_eq!(next_message(&mut c).await.kind.dispatch_key(), "fanout");

        // `a` only sees the next unexcluded broadcast.
        server.broadcast(&Message::new("second"), None).await.unwrap();
        assert_eq!(next_message(&mut a).await.kind.dispatch_key(), "second");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_clients() {
        let mut server = running_server().await;
        let (mut client, _) = connect(&server).await;
        wait_for_count(&server, 1).await;

        server.stop().await;
        assert_eq!(server.connection_count().await, 0);

        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match client.next().await {
                    None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "client never observed the server closing");
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped() {
        let mut server = server_with(limits(100, 100, 1000)).await;
        // Read the welcome, then never poll again: pings go unanswered.
        let (_silent, _) = connect(&server).await;
        wait_for_count(&server, 1).await;

        wait_for_count(&server, 0).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_responsive_client_survives_pings() {
        let mut server = server_with(limits(50, 100, 1000)).await;
        let (mut client, _) = connect(&server).await;
        let reader = tokio::spawn(async move { while client.next().await.is_some() {} });
        wait_for_count(&server, 1).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.connection_count().await, 1);

        server.stop().await;
        reader.abort();
    }

    #[tokio::test]
    async fn test_stalled_reader_does_not_block_broadcast() {
        let mut server = server_with(limits(0, 0, 200)).await;
        let (_stalled, _) = connect(&server).await;
        let (mut healthy, healthy_id) = connect(&server).await;
        let reader = tokio::spawn(async move { while healthy.next().await.is_some() {} });
        wait_for_count(&server, 2).await;

        let bulk = Message::new("bulk").with_field("data", "x".repeat(1 << 20));
        tokio::time::timeout(Duration::from_secs(10), async {
            while server.connection_count().await > 1 {
                server.broadcast(&bulk, None).await.unwrap();
            }
        })
        .await
        .expect("broadcast never gave up on the stalled reader");

        assert_eq!(server.connection_ids().await, vec![healthy_id]);
        server.stop().await;
        reader.abort();
    }

    #[tokio::test]
    async fn test_stop_abandons_pending_handshakes() {
        let mut server = running_server().await;
        let addr = server.local_addr().unwrap();
        let half_open = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop().await;
        server.start().await.unwrap();

        // The socket was dropped during stop; finishing the upgrade now fails
        // and nothing appears in the restarted server's table.
        let upgrade = tokio::time::timeout(
            Duration::from_secs(2),
            tokio_tungstenite::client_async(format!("ws://{addr}"), half_open),
        )
        .await
        .expect("upgrade on an abandoned socket hung");
        assert!(upgrade.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count().await, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_not_running_errors() {
        let server = ConnectionServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(MessageRouter::new()),
        );
        assert!(matches!(
            server.broadcast(&Message::ping(), None).await,
            Err(NetworkError::NotRunning)
        ));
    }
}
