//! Negative cache of recently failed keys, plus the offered-key subsystem:
//! which peers have announced they hold a key we recently failed on, and
//! which peers asked us for it (so we can offer it back once it shows up).

use gyre_async::time;
use gyre_primitives::key::Key;
use gyre_primitives::network::PeerId;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

const MAX_ENTRIES: usize = 1024;
const MAX_OFFERS_PER_KEY: usize = 8;
const MAX_DENIED_PEERS: usize = 32;
/// Hard ceiling on how long a received offer may claim to stay valid.
const MAX_OFFER_LIFETIME: time::Duration = time::Duration::minutes(10);

#[derive(Clone, Debug)]
pub struct Offer {
    pub peer: PeerId,
    pub authenticator: [u8; 32],
    pub boot_id: u64,
    pub expires: time::Instant,
}

struct Entry {
    time_added: time::Instant,
    expires: time::Instant,
    /// Peers that asked for the key or that we failed against; once the key
    /// arrives, they get an `OfferKey`.
    denied_peers: HashSet<PeerId>,
    offers: Vec<Offer>,
    soft_failures: u64,
}

/// Serialized form of an entry, for the periodic flush. Instants do not
/// survive a restart, so only remaining time is persisted.
#[derive(Clone, Debug, PartialEq, Eq, borsh::BorshSerialize, borsh::BorshDeserialize)]
pub struct PersistedFailureEntry {
    pub key: Key,
    pub time_left_ms: u32,
}

pub struct FailureTable {
    clock: time::Clock,
    inner: Mutex<LruCache<Key, Entry>>,
}

impl FailureTable {
    pub fn new(clock: time::Clock) -> Arc<FailureTable> {
        Arc::new(FailureTable {
            clock,
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(MAX_ENTRIES).unwrap())),
        })
    }

    /// Records a terminal failure for `key`, or refreshes an existing entry.
    ///
    /// The refresh rule never extends an entry: `expires` only moves earlier.
    /// Otherwise a loop A→B→C could feed each node's expiry back into the
    /// others' forever, and a single failure would blacklist the key
    /// indefinitely.
    pub fn on_final_failure(
        &self,
        key: Key,
        failed_peer: Option<PeerId>,
        _htl: u8,
        time_left: time::Duration,
        requestor: Option<PeerId>,
    ) {
        let now = self.clock.now();
        let incoming = now + time_left.max(time::Duration::ZERO);
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&key) {
            if entry.expires <= now {
                // Expired entry: start a fresh blackout.
                entry.time_added = now;
                entry.expires = incoming;
            } else {
                entry.expires = entry.expires.min(incoming);
            }
        } else {
            inner.put(
                key,
                Entry {
                    time_added: now,
                    expires: incoming,
                    denied_peers: HashSet::new(),
                    offers: Vec::new(),
                    soft_failures: 0,
                },
            );
        }
        let entry = inner.get_mut(&key).unwrap();
        for peer in [failed_peer, requestor].into_iter().flatten() {
            if entry.denied_peers.len() < MAX_DENIED_PEERS {
                entry.denied_peers.insert(peer);
            }
        }
    }

    /// Soft failure: telemetry plus routing backoff for the peer; no negative
    /// caching.
    pub fn on_failed(
        &self,
        key: &Key,
        peer: &crate::peer::PeerNode,
        _htl: u8,
        reason: &'static str,
    ) {
        peer.enter_backoff(&self.clock, reason);
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(key) {
            entry.soft_failures += 1;
        }
    }

    /// Remaining blackout for a key, if its entry is live.
    pub fn recently_failed(&self, key: &Key) -> Option<time::Duration> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.peek(key).map(|entry| entry.expires) {
            Some(expires) if expires > now => Some(expires - now),
            Some(_) => {
                inner.pop(key);
                None
            }
            None => None,
        }
    }

    /// Records a peer's announcement that it holds `key`. Only interesting if
    /// we have a live failure entry for the key (i.e. we actually want it).
    pub fn on_offer_received(
        &self,
        peer: PeerId,
        key: Key,
        authenticator: [u8; 32],
        boot_id: u64,
        expiry: time::Duration,
    ) {
        let now = self.clock.now();
        let expires = now + expiry.clamp(time::Duration::ZERO, MAX_OFFER_LIFETIME);
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(&key) else {
            tracing::trace!(target: "network", %peer, %key, "ignoring offer for key without failure entry");
            return;
        };
        entry.offers.retain(|offer| offer.peer != peer);
        if entry.offers.len() < MAX_OFFERS_PER_KEY {
            entry.offers.push(Offer { peer, authenticator, boot_id, expires });
        }
    }

    /// Offers for a key: live ones first, then expired ones (still worth a
    /// try when nothing better exists).
    pub fn get_offers(self: &Arc<Self>, key: &Key) -> OfferList {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut offers = match inner.get(key) {
            Some(entry) => entry.offers.clone(),
            None => Vec::new(),
        };
        offers.sort_by_key(|offer| {
            let live = offer.expires > now;
            (!live, offer.expires)
        });
        OfferList { table: self.clone(), key: *key, offers: offers.into(), last: None }
    }

    fn delete_offer(&self, key: &Key, peer: PeerId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(key) {
            entry.offers.retain(|offer| offer.peer != peer);
        }
    }

    /// The key just got committed locally: the blackout ends, and every peer
    /// recorded as denied should hear an offer.
    pub fn on_block_committed(&self, key: &Key) -> Vec<PeerId> {
        let mut inner = self.inner.lock();
        match inner.pop(key) {
            Some(entry) => entry.denied_peers.into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Live entries in persistable form.
    pub fn snapshot(&self) -> Vec<PersistedFailureEntry> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        inner
            .iter()
            .filter(|(_, entry)| entry.expires > now)
            .map(|(key, entry)| PersistedFailureEntry {
                key: *key,
                time_left_ms: (entry.expires - now).whole_milliseconds().max(0) as u32,
            })
            .collect()
    }

    pub fn load(&self, entries: Vec<PersistedFailureEntry>) {
        for entry in entries {
            self.on_final_failure(
                entry.key,
                None,
                0,
                time::Duration::milliseconds(entry.time_left_ms as i64),
                None,
            );
        }
    }
}

/// Snapshot cursor over a key's offers. `delete_last_offer` removes the
/// offer that `next` just yielded (fatal outcomes); `keep_last_offer` leaves
/// it for other requests (transient outcomes).
pub struct OfferList {
    table: Arc<FailureTable>,
    key: Key,
    offers: std::collections::VecDeque<Offer>,
    last: Option<PeerId>,
}

impl OfferList {
    pub fn next(&mut self) -> Option<Offer> {
        let offer = self.offers.pop_front()?;
        self.last = Some(offer.peer);
        Some(offer)
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn delete_last_offer(&mut self) {
        if let Some(peer) = self.last.take() {
            self.table.delete_offer(&self.key, peer);
        }
    }

    pub fn keep_last_offer(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_async::time::FakeClock;
    use gyre_primitives::hash::CryptoHash;

    fn key(tag: u8) -> Key {
        Key::Chk(CryptoHash::hash(&[tag]))
    }

    fn table(clock: &FakeClock) -> Arc<FailureTable> {
        FailureTable::new(clock.clock())
    }

    #[test]
    fn entry_expires_after_time_left() {
        let clock = FakeClock::default();
        let t = table(&clock);
        t.on_final_failure(key(1), None, 10, time::Duration::seconds(300), None);
        assert_eq!(t.recently_failed(&key(1)), Some(time::Duration::seconds(300)));
        clock.advance(time::Duration::seconds(100));
        assert_eq!(t.recently_failed(&key(1)), Some(time::Duration::seconds(200)));
        clock.advance(time::Duration::seconds(200));
        assert_eq!(t.recently_failed(&key(1)), None);
    }

    #[test]
    fn refresh_never_extends_expiry() {
        let clock = FakeClock::default();
        let t = table(&clock);
        t.on_final_failure(key(1), None, 10, time::Duration::seconds(100), None);
        // A longer incoming time-left must not push the expiry out.
        t.on_final_failure(key(1), None, 10, time::Duration::seconds(600), None);
        assert_eq!(t.recently_failed(&key(1)), Some(time::Duration::seconds(100)));
        // A shorter one pulls it in.
        t.on_final_failure(key(1), None, 10, time::Duration::seconds(30), None);
        assert_eq!(t.recently_failed(&key(1)), Some(time::Duration::seconds(30)));
    }

    #[test]
    fn refresh_after_expiry_starts_fresh() {
        let clock = FakeClock::default();
        let t = table(&clock);
        t.on_final_failure(key(1), None, 10, time::Duration::seconds(10), None);
        clock.advance(time::Duration::seconds(20));
        t.on_final_failure(key(1), None, 10, time::Duration::seconds(50), None);
        assert_eq!(t.recently_failed(&key(1)), Some(time::Duration::seconds(50)));
    }

    #[test]
    fn offers_require_a_failure_entry() {
        let clock = FakeClock::default();
        let t = table(&clock);
        t.on_offer_received(PeerId(9), key(1), [0; 32], 1, time::Duration::seconds(60));
        assert!(t.get_offers(&key(1)).is_empty());
        t.on_final_failure(key(1), None, 10, time::Duration::seconds(300), None);
        t.on_offer_received(PeerId(9), key(1), [0; 32], 1, time::Duration::seconds(60));
        assert!(!t.get_offers(&key(1)).is_empty());
    }

    #[test]
    fn live_offers_come_before_expired_ones() {
        let clock = FakeClock::default();
        let t = table(&clock);
        t.on_final_failure(key(1), None, 10, time::Duration::minutes(10), None);
        t.on_offer_received(PeerId(1), key(1), [1; 32], 1, time::Duration::seconds(5));
        t.on_offer_received(PeerId(2), key(1), [2; 32], 2, time::Duration::minutes(5));
        clock.advance(time::Duration::seconds(30));
        let mut offers = t.get_offers(&key(1));
        assert_eq!(offers.next().unwrap().peer, PeerId(2));
        assert_eq!(offers.next().unwrap().peer, PeerId(1));
        assert!(offers.next().is_none());
    }

    #[test]
    fn delete_last_offer_is_permanent_keep_is_not() {
        let clock = FakeClock::default();
        let t = table(&clock);
        t.on_final_failure(key(1), None, 10, time::Duration::minutes(10), None);
        t.on_offer_received(PeerId(1), key(1), [1; 32], 1, time::Duration::minutes(5));
        let mut offers = t.get_offers(&key(1));
        offers.next().unwrap();
        offers.keep_last_offer();
        assert!(!t.get_offers(&key(1)).is_empty());
        let mut offers = t.get_offers(&key(1));
        offers.next().unwrap();
        offers.delete_last_offer();
        assert!(t.get_offers(&key(1)).is_empty());
    }

    #[test]
    fn committed_block_drains_denied_peers() {
        let clock = FakeClock::default();
        let t = table(&clock);
        t.on_final_failure(key(1), Some(PeerId(5)), 10, time::Duration::minutes(5), Some(PeerId(6)));
        let mut peers = t.on_block_committed(&key(1));
        peers.sort();
        assert_eq!(peers, vec![PeerId(5), PeerId(6)]);
        // Entry is gone: the blackout ends with the commit.
        assert_eq!(t.recently_failed(&key(1)), None);
        assert!(t.on_block_committed(&key(1)).is_empty());
    }

    #[test]
    fn snapshot_roundtrips_remaining_time() {
        let clock = FakeClock::default();
        let t = table(&clock);
        t.on_final_failure(key(1), None, 10, time::Duration::seconds(120), None);
        clock.advance(time::Duration::seconds(20));
        let snapshot = t.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].time_left_ms, 100_000);
        let restored = table(&clock);
        restored.load(snapshot);
        assert_eq!(restored.recently_failed(&key(1)), Some(time::Duration::seconds(100)));
    }

    #[test]
    fn offer_lifetime_is_capped() {
        let clock = FakeClock::default();
        let t = table(&clock);
        t.on_final_failure(key(1), None, 10, time::Duration::minutes(30), None);
        t.on_offer_received(PeerId(1), key(1), [1; 32], 1, time::Duration::hours(6));
        clock.advance(MAX_OFFER_LIFETIME + time::Duration::seconds(1));
        // The offer is now expired regardless of what the peer claimed.
        let mut offers = t.get_offers(&key(1));
        let offer = offers.next().unwrap();
        assert!(offer.expires <= clock.now());
    }
}
