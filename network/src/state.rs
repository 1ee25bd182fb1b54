use crate::config::{NetworkConfig, OverridableConfig};
use crate::failure_table::FailureTable;
use crate::network_protocol::Message;
use crate::opennet::OpennetHooks;
use crate::peer::{PeerNode, PeerRegistry};
use crate::stats::NodeStats;
use crate::transport::{MessageItem, Priority, TrackerError};
use crate::uid_registry::UidRegistry;
use crate::waiters::MessageWaiters;
use gyre_async::time;
use gyre_primitives::key::Key;
use gyre_primitives::location::Location;
use gyre_primitives::network::{PeerId, Uid};
use gyre_store::block_store::{BlockStore, PutOutcome, StoreTier};
use hmac::Mac as _;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use std::collections::HashMap;
use std::sync::Arc;

/// State shared between the dispatcher, the request tasks and the transport
/// plumbing. One per node.
pub struct NetworkState {
    pub clock: time::Clock,
    pub config: OverridableConfig,
    pub my_peer_id: PeerId,
    my_location: Mutex<Location>,
    /// Random per process start; lets offer consumers detect that an offerer
    /// restarted (and so lost its shallow store).
    pub boot_id: u64,
    /// Secret behind offer authenticators.
    node_secret: [u8; 32],
    pub peers: PeerRegistry,
    pub failure_table: Arc<FailureTable>,
    pub uids: Arc<UidRegistry>,
    pub stats: NodeStats,
    pub store: Arc<dyn BlockStore>,
    pub(crate) waiters: Arc<MessageWaiters>,
    pub(crate) transfers: TransferRegistry,
    pub opennet: Arc<dyn OpennetHooks>,
    /// Sticky coin for HTL decrement at max on locally-originated requests;
    /// per-peer coins live on the `PeerNode`.
    local_decrement_at_max: bool,
    rng: Mutex<StdRng>,
}

impl NetworkState {
    pub fn new(
        clock: time::Clock,
        config: NetworkConfig,
        my_peer_id: PeerId,
        my_location: Location,
        store: Arc<dyn BlockStore>,
        opennet: Arc<dyn OpennetHooks>,
        rng_seed: u64,
    ) -> Arc<NetworkState> {
        let mut rng = StdRng::seed_from_u64(rng_seed);
        let reject_time = config.reject_time();
        let window = config.recently_completed_window_size;
        let p = config.htl_decrement_probability_at_max;
        Arc::new(NetworkState {
            my_peer_id,
            my_location: Mutex::new(my_location),
            boot_id: rng.r#gen(),
            node_secret: rng.r#gen(),
            peers: PeerRegistry::new(),
            failure_table: FailureTable::new(clock.clone()),
            uids: UidRegistry::new(clock.clone(), reject_time, window),
            stats: NodeStats::new(clock.clone()),
            store,
            waiters: MessageWaiters::new(),
            transfers: TransferRegistry::default(),
            opennet,
            local_decrement_at_max: rng.gen_bool(p),
            rng: Mutex::new(rng),
            clock,
            config: OverridableConfig::new(config),
        })
    }

    pub fn my_location(&self) -> Location {
        *self.my_location.lock()
    }

    pub fn set_my_location(&self, location: Location) {
        *self.my_location.lock() = location;
        for peer in self.peers.connected() {
            self.send_to_peer(&peer, Message::LocationChanged { location }, Priority::Low);
        }
    }

    pub fn random_uid(&self) -> Uid {
        Uid(self.rng.lock().r#gen())
    }

    /// Sticky coin for a newly learned peer.
    pub fn roll_decrement_at_max(&self) -> bool {
        let p = self.config.get().htl_decrement_probability_at_max;
        self.rng.lock().gen_bool(p)
    }

    /// One-in-`random_reinsert_interval` roll.
    pub(crate) fn roll_random_reinsert(&self) -> bool {
        let interval = self.config.get().random_reinsert_interval.max(1);
        self.rng.lock().gen_ratio(1, interval)
    }

    /// HTL decrement rule: at the maximum, the coin of the peer the request
    /// came from (or our own, for local requests) decides whether HTL drops,
    /// so the first hops cannot tell how far from the origin they are. Below
    /// the maximum it always drops, bottoming out at zero.
    pub(crate) fn decrement_htl(&self, from: Option<&PeerNode>, htl: u8) -> u8 {
        let max = self.config.get().htl_max;
        let htl = htl.min(max);
        if htl == max {
            let decrement = from.map_or(self.local_decrement_at_max, |p| p.decrement_htl_at_max);
            if !decrement {
                return htl;
            }
        }
        htl.saturating_sub(1)
    }

    /// HMAC tying an offer for `key` to this node's current boot.
    pub fn offer_authenticator(&self, key: &Key) -> [u8; 32] {
        let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(&self.node_secret)
            .expect("hmac accepts any key length");
        mac.update(key.routing_hash().as_bytes());
        mac.update(&self.boot_id.to_le_bytes());
        mac.finalize().into_bytes().into()
    }

    pub fn verify_offer_authenticator(&self, key: &Key, authenticator: &[u8; 32]) -> bool {
        // Not secret-dependent in timing: the authenticator gates cache
        // access, not authentication of a principal.
        self.offer_authenticator(key) == *authenticator
    }

    /// Queues a message to a peer. Returns false if the peer has no live
    /// connection.
    pub(crate) fn send_to_peer(&self, peer: &PeerNode, message: Message, priority: Priority) -> bool {
        match peer.connection() {
            Some(conn) => {
                conn.enqueue(MessageItem::new(message, priority));
                true
            }
            None => false,
        }
    }

    /// Sends and waits until the datagram is on the wire.
    pub(crate) async fn send_to_peer_now(
        &self,
        peer: &PeerNode,
        message: Message,
        priority: Priority,
    ) -> Result<(), TrackerError> {
        match peer.connection() {
            Some(conn) => conn.send_now(MessageItem::new(message, priority)).await,
            None => Err(TrackerError::NotConnected),
        }
    }

    /// Commits a block and announces it to every peer recorded as denied for
    /// its key while it was missing.
    pub fn commit_block(
        &self,
        block: gyre_primitives::block::KeyBlock,
        tier: StoreTier,
    ) -> PutOutcome {
        let key = block.key();
        let outcome = self.store.put(block, tier);
        if matches!(outcome, PutOutcome::Collision(_)) {
            return outcome;
        }
        let denied = self.failure_table.on_block_committed(&key);
        if !denied.is_empty() {
            let expiry_ms = self.config.get().reject_time_ms.min(u32::MAX as u64) as u32;
            let authenticator = self.offer_authenticator(&key);
            for peer_id in denied {
                if let Some(peer) = self.peers.get(&peer_id) {
                    self.send_to_peer(
                        &peer,
                        Message::OfferKey { key, authenticator, expiry_ms },
                        Priority::Low,
                    );
                }
            }
        }
        outcome
    }
}

/// Guards against two concurrent transfers of the same key. The second
/// comer waits for the first to finish and then probes the store.
#[derive(Default)]
pub(crate) struct TransferRegistry {
    inner: Mutex<HashMap<Key, Arc<tokio::sync::Notify>>>,
}

impl TransferRegistry {
    /// Claims the key for a transfer, or returns the notifier of the
    /// transfer already in progress.
    pub fn try_begin(&self, key: Key) -> Result<Arc<tokio::sync::Notify>, Arc<tokio::sync::Notify>> {
        let mut inner = self.inner.lock();
        match inner.get(&key) {
            Some(existing) => Err(existing.clone()),
            None => {
                let notify = Arc::new(tokio::sync::Notify::new());
                inner.insert(key, notify.clone());
                Ok(notify)
            }
        }
    }

    pub fn finish(&self, key: &Key) {
        if let Some(notify) = self.inner.lock().remove(key) {
            notify.notify_waiters();
        }
    }
}
