use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use gsync_network::NetworkConfig;

/// Discover peers on the LAN and sync clipboard and gesture events with them.
#[derive(Parser, Debug)]
#[command(name = "gesture-sync", author, version, about, long_about = None)]
pub struct Args {
    /// Config file (default: ~/.gesture_sync/config.json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address for the WebSocket server
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Peer to connect to on startup (host:port)
    #[arg(short, long)]
    pub peer: Option<String>,

    /// Connect to the first discovered peer when no peer is configured
    #[arg(short, long)]
    pub auto_connect: bool,

    /// Disable LAN discovery
    #[arg(long)]
    pub no_discovery: bool,

    /// UDP port for discovery beacons
    #[arg(long)]
    pub discovery_port: Option<u16>,

    /// Address to announce instead of the detected one
    #[arg(long)]
    pub advertise_ip: Option<IpAddr>,

    /// Log filter directive, e.g. "debug" or "gsync_network=trace"
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for log files (default: ~/.gesture_sync/logs)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Seconds between peer roster reports
    #[arg(long, default_value = "10")]
    pub report_interval: u64,
}

impl Args {
    /// Overlay the flags that were given onto a loaded config.
    pub fn apply(&self, config: &mut NetworkConfig) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(peer) = &self.peer {
            config.peer = Some(peer.clone());
        }
        if self.no_discovery {
            config.discovery_enabled = false;
        }
        if let Some(port) = self.discovery_port {
            config.discovery_port = port;
        }
        if let Some(ip) = self.advertise_ip {
            config.advertise_ip = Some(ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_flags_leaves_config_untouched() {
        let args = Args::try_parse_from(["gesture-sync"]).unwrap();
        let mut config = NetworkConfig::default();
        args.apply(&mut config);

        let defaults = NetworkConfig::default();
        assert_eq!(config.listen_addr, defaults.listen_addr);
        assert!(config.discovery_enabled);
        assert!(config.peer.is_none());
        assert_eq!(args.report_interval, 10);
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "gesture-sync",
            "--listen",
            "127.0.0.1:9001",
            "--peer",
            "192.168.1.30:8001",
            "--no-discovery",
            "--discovery-port",
            "9002",
            "--advertise-ip",
            "192.168.1.10",
        ])
        .unwrap();

        let mut config = NetworkConfig::default();
        config.peer = Some("old:1".into());
        args.apply(&mut config);

        assert_eq!(config.listen_addr, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(config.peer.as_deref(), Some("192.168.1.30:8001"));
        assert!(!config.discovery_enabled);
        assert_eq!(config.discovery_port, 9002);
        assert_eq!(config.advertise_ip, Some("192.168.1.10".parse().unwrap()));
    }

    #[test]
    fn test_invalid_listen_address_rejected() {
        assert!(Args::try_parse_from(["gesture-sync", "--listen", "nope"]).is_err());
    }
}
