use anyhow::Context as _;
use clap::Parser;
use gyre_async::time;
use gyre_network::config::NetworkConfig;
use gyre_network::opennet::NoopOpennet;
use gyre_network::transport::socket::DatagramSocket;
use gyre_network::Node;
use gyre_primitives::location::Location;
use gyre_primitives::network::PeerId;
use gyre_store::block_store::MemoryBlockStore;
use gyre_store::TestDB;
use rand::Rng as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// gyre node daemon.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Network config (JSON, partial fields allowed). Defaults apply when
    /// absent.
    #[arg(long)]
    config: Option<PathBuf>,
    /// UDP address to listen on.
    #[arg(long, default_value = "0.0.0.0:24820")]
    listen: SocketAddr,
    /// Our location on the keyspace circle; random if not given.
    #[arg(long)]
    location: Option<f64>,
    /// Static peer list (JSON array of {id, addr, location, boot_id}).
    #[arg(long)]
    peers: Option<PathBuf>,
}

#[derive(serde::Deserialize, Debug)]
struct PeerEntry {
    id: u64,
    addr: SocketAddr,
    location: Option<f64>,
    boot_id: u64,
}

fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,network=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<NetworkConfig>(&raw).context("parsing config")?
        }
        None => NetworkConfig::default(),
    };

    let mut rng = rand::thread_rng();
    let my_peer_id = PeerId::random(&mut rng);
    let my_location = Location::normalize(cli.location.unwrap_or_else(|| rng.r#gen()));
    let socket = DatagramSocket::bind_udp(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    tracing::info!(target: "gyred", %my_peer_id, %my_location, listen = %socket.local_addr(), "starting");

    let node = Node::new(
        time::Clock::real(),
        config,
        my_peer_id,
        my_location,
        Arc::new(MemoryBlockStore::new(4096, 1024)),
        TestDB::new(),
        socket,
        Arc::new(NoopOpennet),
        rng.r#gen(),
    );

    if let Some(path) = &cli.peers {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading peers {}", path.display()))?;
        let peers: Vec<PeerEntry> = serde_json::from_str(&raw).context("parsing peers")?;
        for peer in peers {
            node.add_peer(
                PeerId(peer.id),
                peer.addr,
                peer.location.map(Location::normalize),
                peer.boot_id,
            );
            tracing::info!(target: "gyred", id = peer.id, addr = %peer.addr, "added peer");
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!(target: "gyred", "shutting down");
    Ok(())
}
