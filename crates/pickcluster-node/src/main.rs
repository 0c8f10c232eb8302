//! pickcluster - a peer-to-peer protocol node.
//!
//! Connects to a bootstrap peer, performs the version handshake and keeps
//! the connection alive with pings until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use pickcluster_node::{parse_peer_addr, Network, Node, NodeConfig, PingManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, info_span, Level};
use tracing_subscriber::FmtSubscriber;

/// Peer-to-peer protocol node.
#[derive(Parser, Debug)]
#[command(name = "pickcluster")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pickcluster.toml")]
    config: PathBuf,

    /// Network to connect to [default: the config file's, else main]
    #[arg(short, long, value_enum)]
    network: Option<Network>,

    /// Peer to connect to, as host:port
    #[arg(long)]
    connect: Option<String>,

    /// Accept inbound peers on this address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting pickcluster v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_with_network(&args.config, args.network)?;
    if let Some(listen) = args.listen {
        config.listen_addr = Some(listen);
    }
    if let Some(peer) = args.connect {
        config.bootstrap_peer = Some(peer);
    }
    config.validate()?;

    info!("Network: {:?}", config.network);
    if let Some(addr) = config.listen_addr {
        info!("P2P: {}", addr);
    }

    let (mut node, handle) = Node::new(config.clone(), info_span!("node"))
        .await
        .context("Failed to start node")?;
    node.register_handler(Box::new(PingManager::new(config.ping_interval())));
    let node_task = tokio::spawn(node.run());

    if let Some(peer) = &config.bootstrap_peer {
        let (host, port) = parse_peer_addr(peer, config.network.default_port())?;
        handle.connect(host, port)?;
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");
    handle.shutdown().await?;
    node_task.await?;

    info!("pickcluster stopped");
    Ok(())
}
