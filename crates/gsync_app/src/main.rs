mod cli;
mod logging;
mod paths;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use gsync_network::{
    ClientEvent, ClipboardSync, GestureCommand, MessageKind, NetworkConfig, NodeStatus, Payload,
    SyncNode, handler_fn,
};

use crate::cli::Args;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Wire the application message types to the node. Clipboard decryption and
/// gesture execution live outside this binary, so both handlers only decode
/// and record what arrived.
fn register_handlers(node: &SyncNode) {
    node.register_handler(
        MessageKind::ClipboardSync,
        handler_fn(|msg, ctx| async move {
            let sync = ClipboardSync::from_message(&msg)?;
            info!(
                "Clipboard sync from {} ({}): {} bytes, checksum {}",
                ctx.connection_id(),
                ctx.remote_addr(),
                sync.content.len(),
                sync.checksum
            );
            Ok(())
        }),
    );

    node.register_handler(
        MessageKind::GestureCommand,
        handler_fn(|msg, ctx| async move {
            let command = GestureCommand::from_message(&msg)?;
            info!(
                "Received gesture command from {}: {}",
                ctx.connection_id(),
                command.gesture
            );
            Ok(())
        }),
    );
}

async fn log_client_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Connected { remote_addr }) => info!("Peer link up ({remote_addr})"),
            Ok(ClientEvent::Disconnected) => info!("Peer link down"),
            Ok(ClientEvent::Reconnecting { attempt, max }) => {
                debug!("Peer link reconnecting ({attempt}/{max})")
            }
            Ok(ClientEvent::ReconnectExhausted { attempts }) => {
                warn!("Peer unreachable after {attempts} attempts; waiting for a new peer")
            }
            Err(broadcast::error::RecvError::Lagged(n)) => debug!("Skipped {n} client events"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Periodic work
// ---------------------------------------------------------------------------

/// Whether to dial a discovered peer. A client that lost its link but is
/// still retrying is left alone; only one that never had a target, was
/// disconnected, or spent its retry budget is redirected.
fn should_auto_connect(auto_connect: bool, status: &NodeStatus) -> bool {
    auto_connect && !status.client_session_active
}

/// Log the live peer roster and, with `auto_connect`, dial the first peer
/// whenever the node has no outbound session.
async fn tick(node: &mut SyncNode, auto_connect: bool) {
    let peers = node.list_peers();
    if peers.is_empty() {
        debug!("No peers discovered");
    } else {
        let roster: Vec<String> = peers
            .iter()
            .map(|p| format!("{} ({})", p.hostname, p.addr))
            .collect();
        info!("{} peer(s) on the network: {}", peers.len(), roster.join(", "));
    }

    let status = node.status().await;
    match serde_json::to_string(&status) {
        Ok(json) => debug!("Node status: {json}"),
        Err(e) => debug!("Node status unavailable: {e}"),
    }

    if should_auto_connect(auto_connect, &status) {
        if let Some(peer) = peers.first() {
            info!("Auto-connecting to {} ({})", peer.hostname, peer.addr);
            if let Err(e) = node.connect(&peer.addr.to_string()).await {
                warn!("Auto-connect to {} failed: {e}", peer.addr);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn load_config(args: &Args) -> Result<NetworkConfig> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => paths::config_path()?,
    };

    let mut config = NetworkConfig::load_or_default(&path);
    if !path.exists() {
        match config.save_to_file(&path) {
            Ok(()) => info!("Wrote default config to {}", path.display()),
            Err(e) => warn!("Could not write default config: {e}"),
        }
    }
    args.apply(&mut config);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let logs_dir = match &args.log_dir {
        Some(dir) => dir.clone(),
        None => paths::logs_dir()?,
    };
    let _log_guard = logging::init_logging(&logs_dir, args.log_level.as_deref())
        .context("Failed to initialize logging")?;

    info!("Starting gesture-sync v{}", env!("CARGO_PKG_VERSION"));
    let config = load_config(&args)?;
    info!(
        "Messaging on {}, discovery {} (port {})",
        config.listen_addr,
        if config.discovery_enabled { "on" } else { "off" },
        config.discovery_port
    );

    let mut node = SyncNode::new(config);
    register_handlers(&node);
    tokio::spawn(log_client_events(node.client_events()));

    node.start().await.context("Failed to start sync node")?;

    let mut ticker = tokio::time::interval(Duration::from_secs(args.report_interval.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => tick(&mut node, args.auto_connect).await,
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Ctrl-C handler failed: {e}");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    node.stop().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
