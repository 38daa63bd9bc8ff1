//! SyncNode — top-level coordinator for the networking layer.
//!
//! [`SyncNode`] is the API the rest of the application talks to. It owns:
//! - the WebSocket server (peers connecting to us)
//! - one outbound client (us connecting to a peer), with auto-reconnect
//! - LAN discovery (beacon + listener feeding the peer registry)
//! - the message router shared by both connection roles

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::client::{ClientConfig, ClientEvent, ClientState, ConnectionClient};
use crate::config::NetworkConfig;
use crate::connection::{ConnectionId, KeepaliveConfig};
use crate::discovery::{DiscoveryBeacon, DiscoveryListener};
use crate::error::NetworkError;
use crate::message::{Message, MessageKind};
use crate::netif::{NetworkInterfaces, SystemInterfaces};
use crate::registry::{Peer, PeerRegistry};
use crate::router::{MessageHandler, MessageRouter};
use crate::server::{ConnectionServer, ServerState};

/// Point-in-time view of a node, for status displays and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub running: bool,
    pub server_state: ServerState,
    pub listen_addr: Option<SocketAddr>,
    pub connection_count: usize,
    pub client_state: ClientState,
    pub client_peer: Option<SocketAddr>,
    /// The client is connected or still retrying; `false` once it gave up.
    pub client_session_active: bool,
    pub reconnect_attempts: u32,
    pub discovery_running: bool,
    pub peer_count: usize,
}

/// One host's participation in the sync network.
pub struct SyncNode {
    config: NetworkConfig,
    router: Arc<MessageRouter>,
    registry: Arc<Mutex<PeerRegistry>>,
    beacon: DiscoveryBeacon,
    listener: DiscoveryListener,
    server: ConnectionServer,
    client: ConnectionClient,
    running: bool,
}

impl SyncNode {
    /// Create a node that introspects the host's network interfaces.
    pub fn new(config: NetworkConfig) -> Self {
        let interfaces = Arc::new(SystemInterfaces::from_config(&config));
        Self::with_interfaces(config, interfaces)
    }

    /// Create a node with an explicit source of local addressing.
    pub fn with_interfaces(config: NetworkConfig, interfaces: Arc<dyn NetworkInterfaces>) -> Self {
        let router = Arc::new(MessageRouter::new());
        let registry = Arc::new(Mutex::new(PeerRegistry::new()));

        Self {
            beacon: DiscoveryBeacon::new(&config, Arc::clone(&interfaces)),
            listener: DiscoveryListener::new(&config, interfaces, Arc::clone(&registry)),
            server: ConnectionServer::new(config.listen_addr, Arc::clone(&router))
                .with_keepalive(KeepaliveConfig::from(&config)),
            client: ConnectionClient::new(ClientConfig::from(&config), Arc::clone(&router)),
            config,
            router,
            registry,
            running: false,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The router shared by the server and client roles.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Register a handler for a message type, on both connection roles.
    pub fn register_handler(&self, kind: impl Into<MessageKind>, handler: MessageHandler) {
        self.router.register(kind, handler);
    }

    /// Whether the outbound client is connected or between reconnect attempts.
    pub fn has_client_session(&self) -> bool {
        self.client.has_session()
    }

    /// Client session notifications (connect, loss, reconnect progress).
    pub fn client_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.client.subscribe()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start the server, then discovery, then the configured bootstrap peer.
    ///
    /// Only a server bind failure is returned. Discovery and the bootstrap
    /// connection are best-effort: failures are logged and the node keeps
    /// running (the client keeps retrying the peer on its own).
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.running {
            return Ok(());
        }

        self.start_server().await?;

        if self.config.discovery_enabled {
            if let Err(e) = self.start_discovery().await {
                warn!("Discovery start failed (non-fatal): {e}");
            }
        }

        if let Some(peer) = self.config.peer.clone() {
            if let Err(e) = self.connect(&peer).await {
                warn!("Bootstrap connection to {peer} failed, retrying in background: {e}");
            }
        }

        self.running = true;
        info!("SyncNode started");
        Ok(())
    }

    /// Stop everything. Idempotent.
    pub async fn stop(&mut self) {
        self.client.disconnect().await;
        self.stop_discovery().await;
        self.stop_server().await;
        if self.running {
            self.running = false;
            info!("SyncNode stopped");
        }
    }

    pub async fn start_server(&mut self) -> Result<(), NetworkError> {
        self.server.start().await?;
        if let Some(addr) = self.server.local_addr() {
            self.beacon.set_messaging_port(addr.port());
        }
        Ok(())
    }

    pub async fn stop_server(&mut self) {
        self.server.stop().await;
    }

    /// Start the beacon and the listener. Each runs independently: if one
    /// fails to bind the other is left running and the error is returned.
    pub async fn start_discovery(&mut self) -> Result<(), NetworkError> {
        let beacon = self.beacon.start().await;
        let listener = self.listener.start().await;
        beacon.and(listener)
    }

    pub async fn stop_discovery(&mut self) {
        self.beacon.stop().await;
        self.listener.stop().await;
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Open the outbound connection to `addr` (`host:port`), replacing any
    /// existing one. See [`ConnectionClient::connect`].
    pub async fn connect(&mut self, addr: &str) -> Result<(), NetworkError> {
        self.client.connect(addr).await
    }

    /// Drop the outbound connection without reconnecting.
    pub async fn disconnect(&mut self) {
        self.client.disconnect().await;
    }

    /// Send on the outbound connection.
    pub async fn send(&self, message: &Message) -> Result<(), NetworkError> {
        self.client.send(message).await
    }

    /// Send to one inbound connection.
    pub async fn send_to(&self, id: &ConnectionId, message: &Message) -> Result<(), NetworkError> {
        self.server.send(id, message).await
    }

    /// Fan a message out to every inbound connection except `exclude`, and to
    /// the outbound connection if there is one. Returns the delivery count.
    pub async fn broadcast(&self, message: &Message, exclude: Option<&ConnectionId>) -> usize {
        let mut delivered = 0;

        if self.server.is_running() {
            match self.server.broadcast(message, exclude).await {
                Ok(n) => delivered += n,
                Err(e) => warn!("Server broadcast failed: {e}"),
            }
        }

        if self.client.is_connected() {
            match self.client.send(message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to outbound peer failed: {e}"),
            }
        }

        delivered
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Peers heard from within the staleness window, ordered by address.
    pub fn list_peers(&self) -> Vec<Peer> {
        self.registry
            .lock()
            .snapshot(Utc::now(), self.config.peer_staleness)
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            running: self.running,
            server_state: self.server.state(),
            listen_addr: self.server.local_addr(),
            connection_count: self.server.connection_count().await,
            client_state: self.client.state(),
            client_peer: self.client.peer_addr(),
            client_session_active: self.client.has_session(),
            reconnect_attempts: self.client.reconnect_attempts(),
            discovery_running: self.beacon.is_running() && self.listener.is_running(),
            peer_count: self.list_peers().len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::handler_fn;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            discovery_enabled: false,
            reconnect_delay: Duration::from_millis(50),
            max_reconnect_attempts: 2,
            ..NetworkConfig::default()
        }
    }

    fn forward_to(tx: mpsc::UnboundedSender<Message>) -> MessageHandler {
        handler_fn(move |msg, _ctx| {
            let tx = tx.clone();
            async move {
                tx.send(msg)?;
                Ok(())
            }
        })
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let mut node = SyncNode::new(local_config());
        node.start().await.unwrap();
        node.start().await.unwrap();

        let status = node.status().await;
        assert!(status.running);
        assert_eq!(status.server_state, ServerState::Running);
        assert!(status.listen_addr.is_some());
        assert!(!status.discovery_running);
        assert_eq!(status.client_state, ClientState::Disconnected);

        node.stop().await;
        node.stop().await;
        let status = node.status().await;
        assert!(!status.running);
        assert_eq!(status.server_state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_both_roles() {
        // `hub` accepts `spoke`'s outbound connection.
        let mut hub = SyncNode::new(local_config());
        let (hub_tx, mut hub_rx) = mpsc::unbounded_channel();
        hub.register_handler(MessageKind::GestureCommand, forward_to(hub_tx));
        hub.start().await.unwrap();
        let hub_addr = hub.status().await.listen_addr.unwrap();

        let mut spoke = SyncNode::new(local_config());
        let (spoke_tx, mut spoke_rx) = mpsc::unbounded_channel();
        spoke.register_handler(MessageKind::GestureCommand, forward_to(spoke_tx));
        spoke.start().await.unwrap();
        spoke.connect(&hub_addr.to_string()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), async {
            while hub.status().await.connection_count != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let gesture = Message::new(MessageKind::GestureCommand).with_field("gesture", "swipe");

        // Spoke's broadcast goes out over its client connection.
        assert_eq!(spoke.broadcast(&gesture, None).await, 1);
        let got = tokio::time::timeout(Duration::from_secs(3), hub_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.field("gesture"), Some(&serde_json::json!("swipe")));

        // Hub's broadcast goes out over its server connection.
        assert_eq!(hub.broadcast(&gesture, None).await, 1);
        let got = tokio::time::timeout(Duration::from_secs(3), spoke_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.kind, MessageKind::GestureCommand);

        spoke.stop().await;
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_bootstrap_peer_failure_is_not_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let mut node = SyncNode::new(NetworkConfig {
            peer: Some(dead.to_string()),
            ..local_config()
        });
        let mut events = node.client_events();
        node.start().await.unwrap();
        assert!(node.is_running());

        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ClientEvent::Reconnecting { attempt: 1, max: 2 });
        assert!(node.status().await.client_session_active);

        // Once the budget is spent the client is idle again.
        wait_until(|| !node.has_client_session()).await;
        let status = node.status().await;
        assert!(!status.client_session_active);
        assert_eq!(status.client_state, ClientState::Disconnected);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_send_requires_outbound_connection() {
        let node = SyncNode::new(local_config());
        assert!(matches!(
            node.send(&Message::ping()).await,
            Err(NetworkError::NotConnected)
        ));
        assert!(matches!(
            node.send_to(&ConnectionId::from_string("x"), &Message::ping()).await,
            Err(NetworkError::NotRunning)
        ));
        assert_eq!(node.broadcast(&Message::ping(), None).await, 0);
        assert!(node.list_peers().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_populates_peer_list() {
        use crate::netif::StaticInterfaces;

        let mut config = local_config();
        config.discovery_enabled = true;
        config.discovery_port = 0;
        config.beacon_interval = Duration::from_millis(50);
        config.listener_read_timeout = Duration::from_millis(50);

        let interfaces = Arc::new(StaticInterfaces {
            ip: "127.0.0.1".parse().unwrap(),
            broadcast: Some("127.0.0.1".parse().unwrap()),
            hostname: "node-a".into(),
        });
        let mut node = SyncNode::with_interfaces(config, interfaces);
        node.start().await.unwrap();
        assert!(node.status().await.discovery_running);
        assert!(node.list_peers().is_empty());

        // An announcement aimed at the listener shows up in the peer list.
        let target = node.listener.local_addr().unwrap();
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let foreign = serde_json::json!({
            "ip": "10.9.8.7",
            "port": 8001,
            "hostname": "node-b",
            "timestamp": 1.0
        });
        let dest = SocketAddr::from(([127, 0, 0, 1], target.port()));
        socket
            .send_to(foreign.to_string().as_bytes(), dest)
            .await
            .unwrap();

        wait_until(|| !node.list_peers().is_empty()).await;
        let peers = node.list_peers();
        assert_eq!(peers[0].hostname, "node-b");
        assert_eq!(peers[0].addr, "10.9.8.7:8001".parse().unwrap());

        node.stop().await;
        assert!(!node.status().await.discovery_running);
    }
}
