//! Network configuration for a Gesture Sync node.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the discovery and messaging layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the WebSocket server listens on.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Whether LAN discovery (UDP broadcast) is enabled.
    pub discovery_enabled: bool,

    /// UDP port used for discovery beacons. Must differ from the messaging port.
    pub discovery_port: u16,

    /// Interval between beacon broadcasts.
    #[serde(with = "duration_ms_serde")]
    pub beacon_interval: Duration,

    /// Delay before the beacon retries after a failed broadcast.
    #[serde(with = "duration_ms_serde")]
    pub beacon_retry_backoff: Duration,

    /// Maximum age of a peer announcement before the peer is considered gone.
    #[serde(with = "duration_ms_serde")]
    pub peer_staleness: Duration,

    /// Read timeout of the discovery listener's receive loop.
    #[serde(with = "duration_ms_serde")]
    pub listener_read_timeout: Duration,

    /// Fixed delay between client reconnection attempts.
    #[serde(with = "duration_ms_serde")]
    pub reconnect_delay: Duration,

    /// Number of reconnection attempts before the client gives up.
    pub max_reconnect_attempts: u32,

    /// Interval between WebSocket ping frames on an idle session. Zero
    /// disables keepalive.
    #[serde(with = "duration_ms_serde")]
    pub ping_interval: Duration,

    /// How long a session may stay silent after a ping before it is dropped.
    #[serde(with = "duration_ms_serde")]
    pub ping_timeout: Duration,

    /// Upper bound on writing one frame to a peer.
    #[serde(with = "duration_ms_serde")]
    pub write_timeout: Duration,

    /// Address announced in beacons. Resolved from the system when unset.
    pub advertise_ip: Option<IpAddr>,

    /// Broadcast address for beacons. Derived from `subnet_prefix` when unset.
    pub broadcast_addr: Option<Ipv4Addr>,

    /// Prefix length of the local subnet, used to derive a directed
    /// broadcast address. The limited broadcast address is used when unset.
    pub subnet_prefix: Option<u8>,

    /// Peer (`host:port`) to connect to on startup.
    pub peer: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            discovery_enabled: true,
            discovery_port: 8002,
            beacon_interval: Duration::from_secs(2),
            beacon_retry_backoff: Duration::from_secs(5),
            peer_staleness: Duration::from_secs(10),
            listener_read_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            advertise_ip: None,
            broadcast_addr: None,
            subnet_prefix: None,
            peer: None,
        }
    }
}

impl NetworkConfig {
    /// The messaging port announced to peers.
    pub fn messaging_port(&self) -> u16 {
        self.listen_addr.port()
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    /// Keys absent from the file keep their default values.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
