//! Node assembly: wires the datagram socket, the dispatcher and the
//! persistence flusher together and exposes the local fetch/insert API.

use crate::config::NetworkConfig;
use crate::opennet::OpennetHooks;
use crate::peer::PeerNode;
use crate::request::insert::InsertSender;
use crate::request::sender::RequestSender;
use crate::state::NetworkState;
use crate::store::{KnownPeerRecord, NetStore};
use crate::transport::connection::Connection;
use crate::transport::socket::DatagramSocket;
use crate::transport::{PlainCipher, SessionCipher, TrackerConfig};
use crate::types::{InsertOutcome, RequestOutcome, Status};
use crate::uid_registry::{UidKind, UidLock};
use gyre_async::time;
use gyre_primitives::block::{KeyBlock, SubspacePublicKey};
use gyre_primitives::key::Key;
use gyre_primitives::location::Location;
use gyre_primitives::network::PeerId;
use gyre_store::block_store::BlockStore;
use gyre_store::Database;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Node {
    state: Arc<NetworkState>,
    socket: Arc<DatagramSocket>,
    cipher: Arc<dyn SessionCipher>,
    net_store: NetStore,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: time::Clock,
        config: NetworkConfig,
        my_peer_id: PeerId,
        my_location: Location,
        store: Arc<dyn BlockStore>,
        db: Arc<dyn Database>,
        socket: DatagramSocket,
        opennet: Arc<dyn OpennetHooks>,
        rng_seed: u64,
    ) -> Arc<Node> {
        let state = NetworkState::new(
            clock.clone(),
            config,
            my_peer_id,
            my_location,
            store,
            opennet,
            rng_seed,
        );
        let net_store = NetStore::new(db);
        match net_store.load_failure_entries() {
            Ok(entries) if !entries.is_empty() => {
                tracing::info!(target: "network", count = entries.len(), "restored failure entries");
                state.failure_table.load(entries);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target: "network", ?err, "failed to restore failure entries");
            }
        }
        let node = Arc::new(Node {
            state,
            socket: Arc::new(socket),
            cipher: Arc::new(PlainCipher),
            net_store,
        });
        tokio::spawn(run_reader(node.state.clone(), node.socket.clone()));
        tokio::spawn(run_flusher(node.state.clone(), node.net_store.clone()));
        node
    }

    pub fn state(&self) -> &Arc<NetworkState> {
        &self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Registers a peer session. Session negotiation (key exchange,
    /// handshake) happens above this crate; by the time a peer is added here
    /// it is considered connected.
    pub fn add_peer(
        &self,
        id: PeerId,
        addr: SocketAddr,
        location: Option<Location>,
        boot_id: u64,
    ) -> Arc<PeerNode> {
        let peer = PeerNode::new(id, addr, location, self.state.roll_decrement_at_max());
        peer.set_boot_id(boot_id);
        let tracker_config = TrackerConfig {
            max_coalescing_delay: self.state.config.get().max_coalescing_delay(),
        };
        let conn = Connection::spawn(
            self.state.clock.clone(),
            id,
            addr,
            self.socket.clone(),
            self.cipher.clone(),
            tracker_config,
        );
        peer.set_connected(conn);
        self.state.peers.insert(peer.clone());
        peer
    }

    pub fn disconnect_peer(&self, id: &PeerId) {
        if let Some(peer) = self.state.peers.remove(id) {
            peer.set_disconnected();
        }
    }

    /// Fetches a key: local store first (no wire traffic on a hit), then the
    /// full request state machine.
    pub async fn fetch(&self, key: Key) -> RequestOutcome {
        let config = self.state.config.get();
        if let Some(block) = self.state.store.get(&key) {
            return RequestOutcome {
                status: Status::Success,
                block: Some(block),
                pubkey: None,
                time_left: None,
                final_htl: config.htl_max,
                data_source: None,
            };
        }
        let kind = if key.is_ssk() { UidKind::SskRequest } else { UidKind::ChkRequest };
        let lock = self.fresh_uid_lock(kind);
        let uid = lock.uid();
        let outcome =
            RequestSender::new(self.state.clone(), uid, key, config.htl_max, None, false)
                .run()
                .await;
        if outcome.status == Status::Success && config.path_folding {
            if let Some(data_source) = outcome.data_source {
                self.state.opennet.on_request_success(uid, data_source);
            }
        }
        drop(lock);
        outcome
    }

    /// Inserts a block: committed to the local deep store, then routed toward
    /// the key's location. For SSK blocks the subspace pubkey must be
    /// supplied so downstream hops can verify.
    pub async fn insert(
        &self,
        block: KeyBlock,
        pubkey: Option<SubspacePublicKey>,
    ) -> InsertOutcome {
        if matches!(block, KeyBlock::Ssk(_)) && pubkey.is_none() {
            tracing::error!(target: "network", "ssk insert without its subspace pubkey");
            return InsertOutcome { status: Status::InternalError };
        }
        if let Some(pubkey) = pubkey {
            self.state.store.put_pubkey(pubkey);
        }
        self.state.commit_block(block.clone(), gyre_store::StoreTier::Deep);
        let kind = match &block {
            KeyBlock::Chk(_) => UidKind::ChkInsert,
            KeyBlock::Ssk(_) => UidKind::SskInsert,
        };
        let lock = self.fresh_uid_lock(kind);
        let uid = lock.uid();
        let htl = self.state.config.get().htl_max;
        let mut sub = self.state.waiters.subscribe(uid);
        let outcome = InsertSender::new(self.state.clone(), uid, block, pubkey, htl, None)
            .run(&mut sub)
            .await;
        drop(lock);
        outcome
    }

    fn fresh_uid_lock(&self, kind: UidKind) -> UidLock {
        // Collisions on a random 64-bit UID are vanishingly rare; loop anyway.
        loop {
            let uid = self.state.random_uid();
            if let Some(lock) = self.state.uids.try_lock(uid, kind) {
                return lock;
            }
        }
    }
}

/// Parses inbound datagrams and feeds payload messages to the dispatcher.
async fn run_reader(state: Arc<NetworkState>, socket: Arc<DatagramSocket>) {
    loop {
        let (bytes, from_addr) = match socket.recv_from().await {
            Ok(received) => received,
            Err(err) => {
                tracing::debug!(target: "network", ?err, "socket closed, reader exiting");
                return;
            }
        };
        let Some(peer) = state.peers.by_addr(&from_addr) else {
            tracing::trace!(target: "network", %from_addr, "datagram from unknown address");
            continue;
        };
        let Some(conn) = peer.connection() else { continue };
        let Some(messages) = conn.on_datagram(bytes) else { continue };
        if let Some(ping) = peer.average_ping() {
            state.stats.report_avg_ping(ping);
        }
        for message in messages {
            state.handle_message(peer.clone(), message);
        }
    }
}

/// Periodically flushes failure entries and known peers to storage.
async fn run_flusher(state: Arc<NetworkState>, net_store: NetStore) {
    let clock = state.clock.clone();
    let period = state.config.get().store_flush_interval();
    let mut interval = time::Interval::new(clock.now() + period, period);
    loop {
        interval.tick(&clock).await;
        if let Err(err) = net_store.replace_failure_entries(&state.failure_table.snapshot()) {
            tracing::warn!(target: "network", ?err, "failure entry flush failed");
        }
        for peer in state.peers.all() {
            let record = KnownPeerRecord {
                peer_id: peer.id,
                addr: peer.addr.to_string(),
                location_bits: peer.location().map(|l| l.as_f64().to_bits()),
                boot_id: peer.boot_id(),
            };
            if let Err(err) = net_store.set_known_peer(&record) {
                tracing::warn!(target: "network", ?err, "known peer flush failed");
            }
        }
    }
}
