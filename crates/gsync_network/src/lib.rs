//! Gesture Sync Network — LAN discovery and peer messaging.
//!
//! This crate lets instances of the gesture sync application on one local
//! network find each other and exchange typed JSON messages (clipboard
//! contents, gesture commands).
//!
//! # Architecture
//!
//! - **Discovery**: a UDP broadcast beacon announces this host; a listener
//!   records other hosts' announcements in a staleness-filtered registry.
//! - **Transport**: WebSocket (via `tokio-tungstenite`). A host is a server
//!   for many peers and a client of at most one, with automatic reconnection.
//! - **Protocol**: one JSON object per frame, keyed by a `type` field.
//! - **Routing**: handler-based dispatch shared by both connection roles.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use gsync_network::{MessageKind, NetworkConfig, SyncNode, handler_fn};
//!
//! # async fn example() -> Result<(), gsync_network::NetworkError> {
//! let mut node = SyncNode::new(NetworkConfig::default());
//! node.register_handler(
//!     MessageKind::GestureCommand,
//!     handler_fn(|msg, ctx| async move {
//!         println!("{:?} from {}", msg.field("gesture"), ctx.remote_addr());
//!         Ok(())
//!     }),
//! );
//!
//! node.start().await?;
//! // ... peers appear in node.list_peers(), messages reach the handler ...
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod message;
pub mod netif;
pub mod node;
pub mod payload;
pub mod registry;
pub mod router;
pub mod server;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use client::{ClientConfig, ClientEvent, ClientState, ConnectionClient};
pub use config::NetworkConfig;
pub use connection::{ConnectionContext, ConnectionId, KeepaliveConfig, Role};
pub use discovery::{Announcement, DiscoveryBeacon, DiscoveryListener};
pub use error::NetworkError;
pub use message::{Message, MessageKind};
pub use node::{NodeStatus, SyncNode};
pub use payload::{ClipboardSync, GestureCommand, Payload};
pub use registry::{Peer, PeerRegistry};
pub use router::{DispatchOutcome, MessageHandler, MessageRouter, handler_fn};
pub use server::{ConnectionServer, ServerState};
