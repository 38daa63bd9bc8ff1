use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use gsync_network::netif::{NetworkInterfaces, StaticInterfaces};
use gsync_network::*;
use parking_lot::Mutex;

fn interfaces(ip: &str, hostname: &str) -> Arc<StaticInterfaces> {
    Arc::new(StaticInterfaces {
        ip: ip.parse().unwrap(),
        broadcast: Some(Ipv4Addr::LOCALHOST),
        hostname: hostname.into(),
    })
}

fn fast_config() -> NetworkConfig {
    NetworkConfig {
        discovery_port: 0,
        beacon_interval: Duration::from_millis(50),
        listener_read_timeout: Duration::from_millis(50),
        peer_staleness: Duration::from_millis(400),
        ..NetworkConfig::default()
    }
}

async fn start_listener(
    config: &NetworkConfig,
    ip: &str,
) -> (DiscoveryListener, Arc<Mutex<PeerRegistry>>, u16) {
    let registry = Arc::new(Mutex::new(PeerRegistry::new()));
    let mut listener = DiscoveryListener::new(config, interfaces(ip, "listener"), Arc::clone(&registry));
    listener.start().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, registry, port)
}

fn live_peers(registry: &Mutex<PeerRegistry>, staleness: Duration) -> Vec<Peer> {
    registry.lock().snapshot(Utc::now(), staleness)
}

#[tokio::test]
async fn peer_appears_then_expires_after_beacon_stops() {
    let mut config = fast_config();
    let (mut listener, registry, port) = start_listener(&config, "10.99.0.1").await;

    config.discovery_port = port;
    config.listen_addr = "0.0.0.0:9100".parse().unwrap();
    let mut beacon = DiscoveryBeacon::new(&config, interfaces("127.0.0.1", "laptop"));
    beacon.start().await.unwrap();

    let expected: SocketAddr = "127.0.0.1:9100".parse().unwrap();
    tokio::time::timeout(Duration::from_secs(3), async {
        while live_peers(&registry, config.peer_staleness).is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("beacon never appeared");

    let peers = live_peers(&registry, config.peer_staleness);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].addr, expected);
    assert_eq!(peers[0].hostname, "laptop");

    // While the beacon runs the peer stays fresh past one staleness window.
    tokio::time::sleep(config.peer_staleness + Duration::from_millis(100)).await;
    assert_eq!(live_peers(&registry, config.peer_staleness).len(), 1);

    beacon.stop().await;
    tokio::time::sleep(config.peer_staleness + Duration::from_millis(200)).await;
    assert!(live_peers(&registry, config.peer_staleness).is_empty());

    listener.stop().await;
}

#[tokio::test]
async fn own_announcements_are_ignored() {
    let mut config = fast_config();
    let (mut listener, registry, port) = start_listener(&config, "127.0.0.1").await;

    config.discovery_port = port;
    let mut beacon = DiscoveryBeacon::new(&config, interfaces("127.0.0.1", "self"));
    beacon.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.lock().is_empty());

    beacon.stop().await;
    listener.stop().await;
}

/// Reports no address until `online` is set, like a host waiting on DHCP.
struct LateAddress {
    online: AtomicBool,
    ip: IpAddr,
}

impl NetworkInterfaces for LateAddress {
    fn local_ip(&self) -> Option<IpAddr> {
        self.online.load(Ordering::SeqCst).then_some(self.ip)
    }

    fn broadcast_addr(&self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::LOCALHOST)
    }

    fn hostname(&self) -> String {
        "late".into()
    }
}

#[tokio::test]
async fn self_filter_follows_address_changes() {
    let mut config = fast_config();
    let host = Arc::new(LateAddress {
        online: AtomicBool::new(false),
        ip: "10.20.30.40".parse().unwrap(),
    });

    let registry = Arc::new(Mutex::new(PeerRegistry::new()));
    let mut listener = DiscoveryListener::new(&config, host.clone(), Arc::clone(&registry));
    listener.start().await.unwrap();
    config.discovery_port = listener.local_addr().unwrap().port();
    config.listen_addr = "0.0.0.0:9300".parse().unwrap();

    let mut own = DiscoveryBeacon::new(&config, host.clone());
    own.start().await.unwrap();
    let mut other_config = config.clone();
    other_config.listen_addr = "0.0.0.0:9301".parse().unwrap();
    let mut other = DiscoveryBeacon::new(&other_config, interfaces("10.99.0.2", "other"));
    other.start().await.unwrap();

    let loopback_self: SocketAddr = "127.0.0.1:9300".parse().unwrap();
    let lan_self: SocketAddr = "10.20.30.40:9300".parse().unwrap();
    let foreign: SocketAddr = "10.99.0.2:9301".parse().unwrap();

    // Lookup failing: our loopback fallback is still recognized.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.lock().get(&foreign).is_some(), "listener is not receiving");
    assert!(registry.lock().get(&loopback_self).is_none());

    // Lookup succeeding later: the new address is filtered too.
    host.online.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.lock().get(&lan_self).is_none());
    assert!(registry.lock().get(&foreign).is_some());

    own.stop().await;
    other.stop().await;
    listener.stop().await;
}

#[tokio::test]
async fn listener_survives_garbage_datagrams() {
    let config = fast_config();
    let (mut listener, registry, port) = start_listener(&config, "10.99.0.1").await;
    let target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"\xff\xfe garbage", target).await.unwrap();
    socket.send_to(br#"{"ip":"10.0.0.9"}"#, target).await.unwrap();
    socket
        .send_to(
            br#"{"ip":"10.0.0.9","port":8001,"hostname":"tablet","timestamp":1700000000.0}"#,
            target,
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(3), async {
        while registry.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("valid announcement was never recorded");

    assert_eq!(registry.lock().len(), 1);
    assert!(listener.is_running());
    listener.stop().await;
    assert!(!listener.is_running());
}
