//! LAN peer discovery via UDP broadcast.
//!
//! [`DiscoveryBeacon`] periodically broadcasts an [`Announcement`] for this
//! host; [`DiscoveryListener`] receives announcements from other hosts and
//! records them in a shared [`PeerRegistry`]. The two run independently.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::netif::{NetworkInterfaces, announced_ip, broadcast_or_limited};
use crate::registry::{Peer, PeerRegistry};

/// The datagram a host broadcasts to announce itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    /// Address the host can be reached on.
    pub ip: IpAddr,
    /// The host's messaging (WebSocket) port.
    pub port: u16,
    /// Human-readable host name.
    pub hostname: String,
    /// When the announcement was sent, in Unix seconds.
    pub timestamp: f64,
}

impl Announcement {
    /// Build an announcement stamped with the current time.
    pub fn now(ip: IpAddr, port: u16, hostname: impl Into<String>) -> Self {
        Self {
            ip,
            port,
            hostname: hostname.into(),
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }

    /// The messaging address announced by the peer.
    pub fn messaging_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

// ---------------------------------------------------------------------------
// Beacon
// ---------------------------------------------------------------------------

/// Broadcasts this host's announcement at a fixed interval.
///
/// Best-effort: a failed send is logged and retried after a longer backoff,
/// the loop never ends on its own.
pub struct DiscoveryBeacon {
    discovery_port: u16,
    messaging_port: u16,
    interval: Duration,
    retry_backoff: Duration,
    interfaces: Arc<dyn NetworkInterfaces>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryBeacon {
    /// Create a beacon announcing `config.listen_addr`'s port on
    /// `config.discovery_port`.
    pub fn new(config: &NetworkConfig, interfaces: Arc<dyn NetworkInterfaces>) -> Self {
        Self {
            discovery_port: config.discovery_port,
            messaging_port: config.messaging_port(),
            interval: config.beacon_interval,
            retry_backoff: config.beacon_retry_backoff,
            interfaces,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Override the announced messaging port (e.g. after binding port 0).
    pub fn set_messaging_port(&mut self, port: u16) {
        self.messaging_port = port;
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Bind the sending socket and start the broadcast loop. A no-op if the
    /// beacon is already running.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.is_running() {
            return Ok(());
        }

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], 0));
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| NetworkError::Bind { addr: bind_addr, source })?;
        socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;

        let (shutdown_tx, mut shutdown) = broadcast::channel(1);
        let interfaces = Arc::clone(&self.interfaces);
        let discovery_port = self.discovery_port;
        let messaging_port = self.messaging_port;
        let interval = self.interval;
        let retry_backoff = self.retry_backoff;

        let task = tokio::spawn(async move {
            loop {
                let delay = match send_announcement(
                    &socket,
                    interfaces.as_ref(),
                    messaging_port,
                    discovery_port,
                )
                .await
                {
                    Ok(target) => {
                        trace!("Beacon sent to {target}");
                        interval
                    }
                    Err(e) => {
                        warn!("Beacon broadcast failed, retrying in {retry_backoff:?}: {e}");
                        retry_backoff
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => {
                        debug!("Discovery beacon shutting down");
                        break;
                    }
                }
            }
        });

        info!(
            "Discovery beacon started (port {discovery_port}, every {:?})",
            self.interval
        );
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        Ok(())
    }

    /// Stop broadcasting and release the socket. Safe to call at any time.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
            info!("Discovery beacon stopped");
        }
    }
}

async fn send_announcement(
    socket: &UdpSocket,
    interfaces: &dyn NetworkInterfaces,
    messaging_port: u16,
    discovery_port: u16,
) -> Result<SocketAddr, NetworkError> {
    let announcement = Announcement::now(announced_ip(interfaces), messaging_port, interfaces.hostname());
    let bytes = serde_json::to_vec(&announcement)?;

    let target = SocketAddr::V4(SocketAddrV4::new(
        broadcast_or_limited(interfaces),
        discovery_port,
    ));
    socket.send_to(&bytes, target).await?;
    Ok(target)
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// What the listener did with one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// A peer was inserted or refreshed.
    Recorded,
    /// The announcement came from this host.
    SelfAnnouncement,
    /// The datagram was not a valid announcement.
    Malformed,
}

/// Decode one datagram and record the announcing peer. `local_ip` is the
/// address this host currently announces; matching announcements are dropped.
pub fn ingest_datagram(
    registry: &Mutex<PeerRegistry>,
    local_ip: IpAddr,
    bytes: &[u8],
    source: SocketAddr,
) -> Ingest {
    let announcement = match serde_json::from_slice::<Announcement>(bytes) {
        Ok(a) => a,
        Err(e) => {
            debug!("Discarding malformed discovery datagram from {source}: {e}");
            return Ingest::Malformed;
        }
    };

    if announcement.ip == local_ip {
        trace!("Ignoring our own announcement");
        return Ingest::SelfAnnouncement;
    }

    let addr = announcement.messaging_addr();
    let mut registry = registry.lock();
    if registry.get(&addr).is_none() {
        info!("Discovered peer '{}' at {addr}", announcement.hostname);
    }
    registry.upsert(Peer {
        addr,
        hostname: announcement.hostname,
        last_seen: Utc::now(),
        announced_at: announcement.timestamp,
    });
    Ingest::Recorded
}

/// Receives announcements on the discovery port and records them.
pub struct DiscoveryListener {
    port: u16,
    read_timeout: Duration,
    interfaces: Arc<dyn NetworkInterfaces>,
    registry: Arc<Mutex<PeerRegistry>>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryListener {
    pub fn new(
        config: &NetworkConfig,
        interfaces: Arc<dyn NetworkInterfaces>,
        registry: Arc<Mutex<PeerRegistry>>,
    ) -> Self {
        Self {
            port: config.discovery_port,
            read_timeout: config.listener_read_timeout,
            interfaces,
            registry,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The bound discovery address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the discovery port and start receiving. A no-op if already running.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.is_running() {
            return Ok(());
        }

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let socket = bind_reusable_udp(bind_addr)
            .map_err(|source| NetworkError::Bind { addr: bind_addr, source })?;
        let local_addr = socket.local_addr()?;

        let interfaces = Arc::clone(&self.interfaces);
        let registry = Arc::clone(&self.registry);
        let running = Arc::clone(&self.running);
        let read_timeout = self.read_timeout;
        let (shutdown_tx, mut shutdown) = broadcast::channel(1);

        running.store(true, Ordering::Release);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while running.load(Ordering::Acquire) {
                tokio::select! {
                    result = tokio::time::timeout(read_timeout, socket.recv_from(&mut buf)) => {
                        match result {
                            Ok(Ok((len, source))) => {
                                // Resolved per datagram: the address can change
                                // (DHCP, interface up) while we listen.
                                let local_ip = announced_ip(interfaces.as_ref());
                                ingest_datagram(&registry, local_ip, &buf[..len], source);
                            }
                            Ok(Err(e)) => {
                                warn!("Discovery recv error: {e}");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                            // Timed out; re-check the running flag.
                            Err(_) => continue,
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Discovery listener shutting down");
                        break;
                    }
                }
            }
            running.store(false, Ordering::Release);
        });

        info!("Discovery listener bound to {local_addr}");
        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        Ok(())
    }

    /// Stop receiving and release the socket. Safe to call at any time.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
            info!("Discovery listener stopped");
        }
        self.local_addr = None;
    }
}

/// Bind a broadcast-capable UDP socket with `SO_REUSEADDR`, so several
/// processes on one host can share the discovery port.
fn bind_reusable_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(addr))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
