use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kademlia_dialer::{
    ContactSource, Dialer, DialerConfig, Info, Keypair, Node, NodeDirectory, NodeId, NodeType, QuicTransport,
    Responder,
};

const DIRECTORY_CAPACITY: usize = 10_000;

/// A peer given as `IP:PORT/HEX_NODE_ID`.
#[derive(Clone, Debug)]
struct PeerArg {
    address: String,
    id: NodeId,
}

impl FromStr for PeerArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, id) = s
            .rsplit_once('/')
            .context("peer must include its node ID (format: IP:PORT/NODE_ID)")?;
        let id = NodeId::from_hex(id).context("node ID must be 64 hex characters")?;
        Ok(PeerArg {
            address: address.to_string(),
            id,
        })
    }
}

impl PeerArg {
    fn node(&self) -> Node {
        // The peer's role is not known up front and is not used when dialing.
        Node::new(self.id, self.address.clone(), NodeType::Storage)
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadial")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer PING and FIND_NODE requests until interrupted.
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,

        #[arg(short, long, default_value = "storage")]
        role: NodeType,

        #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
        bootstrap: Vec<String>,
    },
    /// Check that a peer is alive.
    Ping {
        peer: PeerArg,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Print the node ID of whatever answers at an address.
    Identity {
        address: String,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Ask a peer for the nodes closest to a target ID.
    Lookup {
        peer: PeerArg,
        target: NodeId,
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Budget for the whole call, in milliseconds.
    #[arg(long = "timeout-ms", default_value = "10000")]
    timeout_ms: u64,

    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,
}

impl ClientArgs {
    fn dialer(&self, keypair: &Keypair) -> Result<Dialer<QuicTransport>> {
        let transport = QuicTransport::bind(keypair, self.bind)?;
        let config = DialerConfig {
            call_timeout: Some(Duration::from_millis(self.timeout_ms)),
            ..DialerConfig::default()
        };
        Ok(Dialer::with_config(transport, config))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { bind, role, bootstrap } => serve(bind, role, bootstrap).await,
        Command::Ping { peer, client } => {
            let keypair = Keypair::generate();
            let dialer = client.dialer(&keypair)?;
            let result = dialer.ping_node(&peer.node()).await;
            dialer.close().await?;
            let alive = result.with_context(|| format!("ping {} failed", peer.address))?;
            println!("{}/{} alive={alive}", peer.address, peer.id);
            Ok(())
        }
        Command::Identity { address, client } => {
            let keypair = Keypair::generate();
            let dialer = client.dialer(&keypair)?;
            let result = dialer.fetch_peer_identity_unverified(&address).await;
            dialer.close().await?;
            let identity = result.with_context(|| format!("handshake with {address} failed"))?;
            println!("{address}/{}", identity.id);
            Ok(())
        }
        Command::Lookup { peer, target, client } => {
            let keypair = Keypair::generate();
            let dialer = client.dialer(&keypair)?;
            let local_addr = dialer.transport().local_addr()?;
            let sender = Node::new(keypair.node_id(), local_addr.to_string(), NodeType::Uplink);

            let result = dialer.lookup(&sender, &peer.node(), &Node::target(target)).await;
            dialer.close().await?;
            let nodes = result.with_context(|| format!("lookup via {} failed", peer.address))?;
            for node in nodes {
                println!("{}/{} {}", node.address, node.id, node.node_type);
            }
            Ok(())
        }
    }
}

async fn serve(bind: SocketAddr, role: NodeType, bootstrap: Vec<String>) -> Result<()> {
    let keypair = Keypair::generate();
    let version = Info::from_build_env().context("invalid build version metadata")?;
    let directory = Arc::new(NodeDirectory::new(DIRECTORY_CAPACITY));

    let responder = Responder::bind(
        keypair,
        bind,
        role,
        directory.clone(),
        version.is_stamped().then_some(version),
    )?;
    let local = responder.local().clone();
    info!("Node identity: {}", local.id);

    let dialer = Dialer::new(responder.transport()?);
    for address in &bootstrap {
        match bootstrap_from(&dialer, directory.as_ref(), &local, address).await {
            Ok(learned) => info!(bootstrap = %address, learned, "bootstrap complete"),
            Err(e) => warn!(bootstrap = %address, error = %e, "bootstrap failed"),
        }
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal, exiting gracefully");

    if let Err(e) = dialer.close().await {
        warn!(error = %e, "error closing dialer");
    }
    responder.shutdown().await;
    Ok(())
}

/// Learn the bootstrap peer's identity, then ask it for the nodes closest to
/// ourselves and record them (the bootstrap peer included).
async fn bootstrap_from(
    dialer: &Dialer<QuicTransport>,
    directory: &NodeDirectory,
    local: &Node,
    address: &str,
) -> Result<usize> {
    let identity = dialer.fetch_peer_identity_unverified(address).await?;
    info!(bootstrap = %address, peer = %identity.id, "bootstrap peer identified");

    let peer = Node::new(identity.id, address, NodeType::Bootstrap);
    let nodes = dialer.lookup(local, &peer, local).await?;
    let learned = nodes.len();
    for node in nodes {
        directory.observe(node);
    }
    Ok(learned)
}
