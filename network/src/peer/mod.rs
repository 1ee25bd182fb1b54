pub mod selector;

use crate::transport::connection::Connection;
use gyre_async::time;
use gyre_primitives::location::Location;
use gyre_primitives::network::PeerId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Routing backoff starts here and doubles per failure.
const INITIAL_BACKOFF: time::Duration = time::Duration::seconds(1);
/// Cap on the backoff interval.
const MAX_BACKOFF: time::Duration = time::Duration::seconds(180);

#[derive(Clone)]
pub enum ConnectionState {
    Connecting,
    Connected(Arc<Connection>),
    Disconnecting,
    Disconnected,
}

struct RoutingBackoff {
    until: time::Instant,
    length: time::Duration,
    /// Opaque reason tags with counts, surfaced in diagnostics.
    reasons: HashMap<&'static str, u64>,
}

/// A known peer. Long-lived structures refer to peers by `PeerId` and
/// re-resolve through the [`PeerRegistry`]; a node removed from the registry
/// simply stops resolving, which every code path must already tolerate (the
/// peer may disconnect mid-operation).
pub struct PeerNode {
    pub id: PeerId,
    pub addr: SocketAddr,
    state: Mutex<ConnectionState>,
    location: Mutex<Option<Location>>,
    backoff: Mutex<RoutingBackoff>,
    boot_id: AtomicU64,
    /// Sticky coin for the probabilistic HTL decrement at the maximum: fixed
    /// per peer so repeated requests do not leak the chain origin.
    pub decrement_htl_at_max: bool,
}

impl PeerNode {
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        location: Option<Location>,
        decrement_htl_at_max: bool,
    ) -> Arc<PeerNode> {
        Arc::new(PeerNode {
            id,
            addr,
            state: Mutex::new(ConnectionState::Connecting),
            location: Mutex::new(location),
            backoff: Mutex::new(RoutingBackoff {
                until: time::Instant::ZERO,
                length: INITIAL_BACKOFF,
                reasons: HashMap::new(),
            }),
            boot_id: AtomicU64::new(0),
            decrement_htl_at_max,
        })
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        match &*self.state.lock() {
            ConnectionState::Connected(conn) if conn.is_connected() => Some(conn.clone()),
            _ => None,
        }
    }

    pub fn set_connected(&self, conn: Arc<Connection>) {
        *self.state.lock() = ConnectionState::Connected(conn);
    }

    pub fn set_disconnected(&self) {
        let prev = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };
        if let ConnectionState::Connected(conn) = prev {
            conn.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    pub fn location(&self) -> Option<Location> {
        *self.location.lock()
    }

    /// Peers may announce location changes at any time.
    pub fn set_location(&self, location: Location) {
        *self.location.lock() = Some(location);
    }

    pub fn boot_id(&self) -> u64 {
        self.boot_id.load(Ordering::SeqCst)
    }

    pub fn set_boot_id(&self, boot_id: u64) {
        self.boot_id.store(boot_id, Ordering::SeqCst);
    }

    pub fn average_ping(&self) -> Option<time::Duration> {
        self.connection().map(|conn| conn.average_ping())
    }

    /// Applies (and doubles) the routing backoff for this peer.
    pub fn enter_backoff(&self, clock: &time::Clock, reason: &'static str) {
        let now = clock.now();
        let mut backoff = self.backoff.lock();
        let length = backoff.length;
        backoff.until = now + length;
        backoff.length = (length * 2i32).min(MAX_BACKOFF);
        *backoff.reasons.entry(reason).or_insert(0) += 1;
        tracing::debug!(target: "network", peer = %self.id, reason, ?length, "routing backoff");
    }

    /// A successful routed request resets the backoff growth.
    pub fn reset_backoff(&self) {
        self.backoff.lock().length = INITIAL_BACKOFF;
    }

    pub fn is_backed_off(&self, now: time::Instant) -> bool {
        self.backoff.lock().until > now
    }

    pub fn backoff_counts(&self) -> HashMap<&'static str, u64> {
        self.backoff.lock().reasons.clone()
    }

    /// Connected, has a location, and not currently backed off.
    pub fn is_routable(&self, now: time::Instant) -> bool {
        self.is_connected() && self.location().is_some() && !self.is_backed_off(now)
    }
}

/// Arena of known peers keyed by their stable id. Read-mostly; a single
/// writer lock protects the add/remove path.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<PeerNode>>>,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        PeerRegistry::default()
    }

    pub fn insert(&self, peer: Arc<PeerNode>) {
        self.peers.write().insert(peer.id, peer);
    }

    pub fn remove(&self, id: &PeerId) -> Option<Arc<PeerNode>> {
        self.peers.write().remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<PeerNode>> {
        self.peers.read().get(id).cloned()
    }

    pub fn by_addr(&self, addr: &SocketAddr) -> Option<Arc<PeerNode>> {
        self.peers.read().values().find(|p| p.addr == *addr).cloned()
    }

    pub fn all(&self) -> Vec<Arc<PeerNode>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn connected(&self) -> Vec<Arc<PeerNode>> {
        self.peers.read().values().filter(|p| p.is_connected()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_async::time::FakeClock;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new([127, 0, 0, 1].into(), port)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let clock = FakeClock::default();
        let peer = PeerNode::new(PeerId(1), addr(1), None, false);
        assert!(!peer.is_backed_off(clock.now()));
        peer.enter_backoff(&clock.clock(), "test");
        assert!(peer.is_backed_off(clock.now()));
        clock.advance(INITIAL_BACKOFF);
        assert!(!peer.is_backed_off(clock.now()));
        // Second failure backs off for twice as long.
        peer.enter_backoff(&clock.clock(), "test");
        clock.advance(INITIAL_BACKOFF);
        assert!(peer.is_backed_off(clock.now()));
        clock.advance(INITIAL_BACKOFF);
        assert!(!peer.is_backed_off(clock.now()));
        assert_eq!(peer.backoff_counts()["test"], 2);
        // Growth is capped.
        for _ in 0..20 {
            peer.enter_backoff(&clock.clock(), "test");
        }
        clock.advance(MAX_BACKOFF);
        assert!(!peer.is_backed_off(clock.now()));
    }

    #[test]
    fn reset_backoff_restores_initial_length() {
        let clock = FakeClock::default();
        let peer = PeerNode::new(PeerId(1), addr(1), None, false);
        for _ in 0..5 {
            peer.enter_backoff(&clock.clock(), "test");
        }
        peer.reset_backoff();
        clock.advance(MAX_BACKOFF);
        peer.enter_backoff(&clock.clock(), "test");
        clock.advance(INITIAL_BACKOFF);
        assert!(!peer.is_backed_off(clock.now()));
    }

    #[test]
    fn registry_resolves_and_forgets() {
        let registry = PeerRegistry::new();
        let peer = PeerNode::new(PeerId(7), addr(7), None, false);
        registry.insert(peer.clone());
        assert!(registry.get(&PeerId(7)).is_some());
        assert!(registry.by_addr(&addr(7)).is_some());
        registry.remove(&PeerId(7));
        // Dangling refs resolve to None rather than a dead peer.
        assert!(registry.get(&PeerId(7)).is_none());
    }
}
