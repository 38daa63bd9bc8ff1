//! Peer registry — the live roster of hosts heard from via discovery.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A remote host discovered through a beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Messaging address the peer announced (ip + port). Identity key.
    pub addr: SocketAddr,
    /// Hostname the peer announced.
    pub hostname: String,
    /// Local time the most recent announcement was received.
    pub last_seen: DateTime<Utc>,
    /// Timestamp the peer put in its most recent announcement (Unix seconds).
    pub announced_at: f64,
}

/// Registry of discovered peers with lazy staleness eviction.
///
/// There is no background sweep: stale entries are dropped whenever a
/// [`snapshot`](PeerRegistry::snapshot) is taken.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<SocketAddr, Peer>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Insert a peer or refresh an existing entry with the same address.
    ///
    /// `last_seen` never moves backwards: an update carrying an older
    /// receive time keeps the newer one.
    pub fn upsert(&mut self, peer: Peer) {
        match self.peers.get_mut(&peer.addr) {
            Some(existing) => {
                existing.hostname = peer.hostname;
                existing.announced_at = peer.announced_at;
                if peer.last_seen > existing.last_seen {
                    existing.last_seen = peer.last_seen;
                }
            }
            None => {
                self.peers.insert(peer.addr, peer);
            }
        }
    }

    /// Return every peer heard from within `staleness` of `now`, dropping
    /// stale entries from the store.
    pub fn snapshot(&mut self, now: DateTime<Utc>, staleness: Duration) -> Vec<Peer> {
        let window = chrono::Duration::from_std(staleness).unwrap_or(chrono::Duration::MAX);
        self.peers.retain(|_, peer| now.signed_duration_since(peer.last_seen) < window);

        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.addr);
        peers
    }

    /// Get a peer by address without evicting anything.
    pub fn get(&self, addr: &SocketAddr) -> Option<&Peer> {
        self.peers.get(addr)
    }

    /// Number of entries currently stored, stale or not.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
