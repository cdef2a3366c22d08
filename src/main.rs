//! WolfCoord - Leader Election and Service Registry
//!
//! Runs one election participant (plus optional local peers) against the
//! configured coordination service and waits until its session ends.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcoord::config::{BackendKind, WolfCoordConfig};
use wolfcoord::coordination::{Backend, EventDispatcher};
use wolfcoord::error::{Error, Result};
use wolfcoord::node::Node;

/// WolfCoord - Leader Election and Service Registry
#[derive(Parser)]
#[command(name = "wolfcoord")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port advertised in the service registry (default 8000)
    port: Option<u16>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// ZooKeeper connect string; selects the ZooKeeper backend
    #[arg(long)]
    connect: Option<String>,

    /// Extra participants to run locally, on the ports following PORT
    #[arg(long, default_value_t = 0)]
    local_peers: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = WolfCoordConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.node.port = port;
    }
    if let Some(connect) = cli.connect.clone() {
        config.coordination.backend = BackendKind::Zookeeper;
        config.coordination.connect_string = connect;
    }
    config.validate()?;

    // Initialize logging
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    run(config, cli.local_peers).await
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the participants and block until the primary session ends
async fn run(config: WolfCoordConfig, local_peers: u16) -> Result<()> {
    let backend = Backend::from_config(&config);
    match config.coordination.backend {
        BackendKind::Embedded => tracing::info!("Using the embedded coordination service"),
        BackendKind::Zookeeper => tracing::info!(
            "Using ZooKeeper at {}",
            config.coordination.connect_string
        ),
    }

    let (client, events) = backend.open_session().await?;
    let monitor = EventDispatcher::start(events);
    let node = match Node::start(&config, client, monitor).await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("Failed to join the election: {}", e);
            return Err(e);
        }
    };

    let mut peers = Vec::with_capacity(local_peers as usize);
    for offset in 1..=local_peers {
        let mut peer_config = config.clone();
        peer_config.node.port = config
            .node
            .port
            .checked_add(offset)
            .ok_or_else(|| Error::Config(format!("no port left for local peer {}", offset)))?;

        let (client, events) = backend.open_session().await?;
        let monitor = EventDispatcher::start(events);
        peers.push(Node::start(&peer_config, client, monitor).await?);
    }
    if !peers.is_empty() {
        tracing::info!("Started {} local peers", peers.len());
    }

    match node.members().await {
        Ok(members) => tracing::info!("Registered members: {:?}", members.members()),
        Err(e) => tracing::warn!("Could not read registered members: {}", e),
    }

    tokio::select! {
        state = node.wait_for_disconnect() => {
            tracing::info!("Coordination session ended ({})", state);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    // Newest first, so no departure wakes a peer that is about to leave
    for peer in peers.iter().rev() {
        if let Err(e) = peer.shutdown().await {
            tracing::warn!("Failed to stop local peer {}: {}", peer.address(), e);
        }
    }
    node.shutdown().await?;

    let state = node.wait_for_disconnect().await;
    println!("Disconnected from coordination service ({}), exiting", state);
    Ok(())
}
