//! gavel-node: one member of a replicated online auction cluster
//!
//! ```text
//! gavel-node --id Node1 --port 8001 --peers localhost:8002,localhost:8003
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gavel_api::{ApiConfig, ApiServer, HttpTransport};
use gavel_core::{parse_rank, Node, NodeConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gavel-node")]
#[command(author, version, about = "Replicated online auction cluster node")]
struct Cli {
    /// Node id in the form `Node<number>`; the number is the election rank
    #[arg(long)]
    id: String,

    /// Host/IP to bind on (use 0.0.0.0 for LAN)
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long)]
    port: u16,

    /// Comma-separated list of peer addresses (e.g. localhost:8002,localhost:8003)
    #[arg(long, default_value = "")]
    peers: String,

    /// Address peers should dial to reach this node (defaults to host:port,
    /// with a 0.0.0.0 bind replaced by 127.0.0.1)
    #[arg(long)]
    advertise: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let rank = parse_rank(&cli.id)
        .with_context(|| format!("node id {:?} must look like Node1, Node2, ...", cli.id))?;

    let peers: Vec<String> = cli
        .peers
        .split(',')
        .map(str::trim)
        .filter(|peer| !peer.is_empty())
        .map(String::from)
        .collect();
    let bind = format!("{}:{}", cli.host, cli.port);
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid listen address {bind:?}"))?;

    // Peers learn this address from protocol messages and dial it back for
    // forwarded bids and deferred replies, so a wildcard bind must not leak
    // into the directory.
    let advertised = match cli.advertise {
        Some(addr) => addr,
        None if cli.host == "0.0.0.0" => format!("127.0.0.1:{}", cli.port),
        None => bind.clone(),
    };

    tracing::info!(
        id = %cli.id,
        rank,
        %bind,
        %advertised,
        peers = peers.len(),
        "starting auction node"
    );

    let transport = HttpTransport::with_defaults().context("building the peer transport")?;
    let config = NodeConfig::new(cli.id, advertised, peers);
    let node = Node::new(config, Arc::new(transport))?;
    Arc::clone(&node).start();

    // Serves both the client surface and the peer protocol; never returns
    // in the happy path.
    ApiServer::new(node, ApiConfig { bind_addr })
        .serve()
        .await
        .context("http server exited")?;
    Ok(())
}
