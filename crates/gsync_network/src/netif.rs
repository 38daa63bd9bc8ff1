//! Local network introspection used by discovery.
//!
//! Discovery only needs three facts about the host: the address to announce,
//! where to send broadcasts, and a display name. [`NetworkInterfaces`] keeps
//! that lookup behind a trait so tests and fixed deployments can pin it.

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::Ipv4Network;
use tracing::debug;

use crate::config::NetworkConfig;

/// Source of local addressing information.
pub trait NetworkInterfaces: Send + Sync {
    /// Address other hosts should use to reach us.
    fn local_ip(&self) -> Option<IpAddr>;

    /// Broadcast address of the local subnet, if it can be determined.
    fn broadcast_addr(&self) -> Option<Ipv4Addr>;

    /// Human-readable name of this host.
    fn hostname(&self) -> String;
}

/// Resolve the broadcast target, falling back to the limited broadcast
/// address when the subnet cannot be determined.
pub fn broadcast_or_limited(interfaces: &dyn NetworkInterfaces) -> Ipv4Addr {
    interfaces.broadcast_addr().unwrap_or(Ipv4Addr::BROADCAST)
}

/// The address this host announces, or loopback when the lookup fails.
///
/// The beacon and the listener's self filter both go through this, so a host
/// always recognizes its own fallback announcement.
pub fn announced_ip(interfaces: &dyn NetworkInterfaces) -> IpAddr {
    interfaces
        .local_ip()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Introspects the running system via `local-ip-address` and `hostname`.
///
/// Explicit overrides from [`NetworkConfig`] win over system lookups.
#[derive(Debug, Clone, Default)]
pub struct SystemInterfaces {
    advertise_ip: Option<IpAddr>,
    broadcast_addr: Option<Ipv4Addr>,
    subnet_prefix: Option<u8>,
}

impl SystemInterfaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the addressing overrides in a config.
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            advertise_ip: config.advertise_ip,
            broadcast_addr: config.broadcast_addr,
            subnet_prefix: config.subnet_prefix,
        }
    }
}

impl NetworkInterfaces for SystemInterfaces {
    fn local_ip(&self) -> Option<IpAddr> {
        if let Some(ip) = self.advertise_ip {
            return Some(ip);
        }
        match local_ip_address::local_ip() {
            Ok(ip) => Some(ip),
            Err(e) => {
                debug!("Local IP lookup failed: {e}");
                None
            }
        }
    }

    fn broadcast_addr(&self) -> Option<Ipv4Addr> {
        if let Some(addr) = self.broadcast_addr {
            return Some(addr);
        }
        let prefix = self.subnet_prefix?;
        match self.local_ip()? {
            IpAddr::V4(ip) => directed_broadcast(ip, prefix),
            IpAddr::V6(_) => None,
        }
    }

    fn hostname(&self) -> String {
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string())
    }
}

/// Fixed addressing, for tests and hosts with static configuration.
#[derive(Debug, Clone)]
pub struct StaticInterfaces {
    pub ip: IpAddr,
    pub broadcast: Option<Ipv4Addr>,
    pub hostname: String,
}

impl NetworkInterfaces for StaticInterfaces {
    fn local_ip(&self) -> Option<IpAddr> {
        Some(self.ip)
    }

    fn broadcast_addr(&self) -> Option<Ipv4Addr> {
        self.broadcast
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }
}

/// Broadcast address of `ip/prefix`, or `None` for an invalid prefix.
pub fn directed_broadcast(ip: Ipv4Addr, prefix: u8) -> Option<Ipv4Addr> {
    Ipv4Network::new(ip, prefix).ok().map(|net| net.broadcast())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
