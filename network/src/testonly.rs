//! Test helpers: connected peers over the in-memory fabric and whole test
//! nodes wired into one network. Not gated on cfg(test) because integration
//! tests use them too.

use crate::config::NetworkConfig;
use crate::node::Node;
use crate::opennet::NoopOpennet;
use crate::peer::PeerNode;
use crate::transport::connection::Connection;
use crate::transport::fabric::Fabric;
use crate::transport::socket::DatagramSocket;
use crate::transport::{PlainCipher, TrackerConfig};
use gyre_async::time;
use gyre_primitives::location::Location;
use gyre_primitives::network::PeerId;
use gyre_store::block_store::MemoryBlockStore;
use gyre_store::TestDB;
use parking_lot::Mutex;
use std::sync::Arc;

/// Builds `PeerNode`s with live connections over a private fabric, for unit
/// tests that need routable peers without full nodes behind them.
pub struct PeerHarness {
    fabric: Arc<Fabric>,
    clock: time::Clock,
    // Keeps remote endpoints alive so sends have somewhere to go.
    endpoints: Mutex<Vec<Arc<DatagramSocket>>>,
}

impl PeerHarness {
    pub fn new(fake: &time::FakeClock) -> PeerHarness {
        PeerHarness { fabric: Fabric::new(), clock: fake.clock(), endpoints: Mutex::new(Vec::new()) }
    }

    pub fn connected_peer(&self, id: PeerId, location: Location) -> Arc<PeerNode> {
        let local = Arc::new(DatagramSocket::Fabric(self.fabric.bind()));
        let remote = Arc::new(DatagramSocket::Fabric(self.fabric.bind()));
        let addr = remote.local_addr();
        let conn = Connection::spawn(
            self.clock.clone(),
            id,
            addr,
            local.clone(),
            Arc::new(PlainCipher),
            TrackerConfig::default(),
        );
        let peer = PeerNode::new(id, addr, Some(location), false);
        peer.set_connected(conn);
        self.endpoints.lock().push(local);
        self.endpoints.lock().push(remote);
        peer
    }
}

/// One in-process node attached to a shared fabric.
pub struct TestNode {
    pub node: Arc<Node>,
    pub id: PeerId,
    pub location: Location,
    pub store: Arc<MemoryBlockStore>,
}

/// A whole test network over one fabric.
pub struct TestNet {
    pub fabric: Arc<Fabric>,
    pub clock: time::Clock,
    pub config: NetworkConfig,
}

impl TestNet {
    pub fn new(clock: time::Clock, config: NetworkConfig) -> TestNet {
        TestNet { fabric: Fabric::new(), clock, config }
    }

    /// A config with timeouts short enough for real-clock tests.
    pub fn fast_config() -> NetworkConfig {
        NetworkConfig {
            accepted_timeout_ms: 500,
            fetch_timeout_ms: 5_000,
            get_offer_timeout_ms: 500,
            block_transfer_packet_timeout_ms: 2_000,
            overall_deadline_ms: 20_000,
            ..NetworkConfig::default()
        }
    }

    pub fn add_node(&self, seed: u64, location: f64) -> TestNode {
        let id = PeerId(seed);
        let store = Arc::new(MemoryBlockStore::default());
        let socket = DatagramSocket::Fabric(self.fabric.bind());
        let node = Node::new(
            self.clock.clone(),
            self.config.clone(),
            id,
            Location::normalize(location),
            store.clone(),
            TestDB::new(),
            socket,
            Arc::new(NoopOpennet),
            seed,
        );
        TestNode { node, id, location: Location::normalize(location), store }
    }

    /// Makes `a` and `b` mutual peers, as a completed session negotiation
    /// would.
    pub fn link(&self, a: &TestNode, b: &TestNode) {
        a.node.add_peer(b.id, b.node.local_addr(), Some(b.location), b.node.state().boot_id);
        b.node.add_peer(a.id, a.node.local_addr(), Some(a.location), a.node.state().boot_id);
    }
}
