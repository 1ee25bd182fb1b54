use gyre_primitives::block::{KeyBlock, SubspacePublicKey};
use gyre_primitives::hash::CryptoHash;
use gyre_primitives::key::Key;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Which tier a block is committed to. The shallow tier is a cache written on
/// transient passes (a request succeeding through this node); the deep tier
/// is written only on inserts and is never evicted by cache pressure.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StoreTier {
    Shallow,
    Deep,
}

/// Outcome of a `put`. On an SSK collision the store keeps the block it
/// already had and hands it back; the caller treats that as success with the
/// stored value.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PutOutcome {
    Stored,
    AlreadyPresent,
    Collision(KeyBlock),
}

/// The block store as seen by the routing engine. Implementations are
/// externally synchronized; all methods are cheap enough to call from
/// request tasks.
pub trait BlockStore: Send + Sync {
    fn get(&self, key: &Key) -> Option<KeyBlock>;
    fn put(&self, block: KeyBlock, tier: StoreTier) -> PutOutcome;
    fn get_pubkey(&self, pubkey_hash: &CryptoHash) -> Option<SubspacePublicKey>;
    fn put_pubkey(&self, pubkey: SubspacePublicKey);
}

struct Inner {
    deep: std::collections::HashMap<Key, KeyBlock>,
    shallow: LruCache<Key, KeyBlock>,
    pubkeys: LruCache<CryptoHash, SubspacePublicKey>,
}

/// In-memory two-tier store.
pub struct MemoryBlockStore(Mutex<Inner>);

impl MemoryBlockStore {
    pub fn new(shallow_capacity: usize, pubkey_capacity: usize) -> MemoryBlockStore {
        MemoryBlockStore(Mutex::new(Inner {
            deep: std::collections::HashMap::new(),
            shallow: LruCache::new(NonZeroUsize::new(shallow_capacity.max(1)).unwrap()),
            pubkeys: LruCache::new(NonZeroUsize::new(pubkey_capacity.max(1)).unwrap()),
        }))
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        MemoryBlockStore::new(1024, 1024)
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, key: &Key) -> Option<KeyBlock> {
        let mut inner = self.0.lock();
        if let Some(block) = inner.deep.get(key) {
            return Some(block.clone());
        }
        inner.shallow.get(key).cloned()
    }

    fn put(&self, block: KeyBlock, tier: StoreTier) -> PutOutcome {
        let key = block.key();
        let mut inner = self.0.lock();
        let existing = inner.deep.get(&key).cloned().or_else(|| inner.shallow.get(&key).cloned());
        if let Some(existing) = existing {
            if existing == block {
                return PutOutcome::AlreadyPresent;
            }
            // CHKs cannot collide (the key is the content hash); an SSK slot
            // can. First write wins.
            return PutOutcome::Collision(existing);
        }
        match tier {
            StoreTier::Deep => {
                inner.deep.insert(key, block);
            }
            StoreTier::Shallow => {
                inner.shallow.put(key, block);
            }
        }
        PutOutcome::Stored
    }

    fn get_pubkey(&self, pubkey_hash: &CryptoHash) -> Option<SubspacePublicKey> {
        self.0.lock().pubkeys.get(pubkey_hash).copied()
    }

    fn put_pubkey(&self, pubkey: SubspacePublicKey) {
        self.0.lock().pubkeys.put(pubkey.hash(), pubkey);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use gyre_primitives::testonly::{make_chk_block, make_ssk_block, SubspaceKeypair};
    use rand::SeedableRng as _;
    use rand_xorshift::XorShiftRng;

    #[test]
    fn shallow_put_then_get() {
        let store = MemoryBlockStore::default();
        let mut rng = XorShiftRng::seed_from_u64(1);
        let block: KeyBlock = make_chk_block(&mut rng).into();
        let key = block.key();
        assert_eq!(store.put(block.clone(), StoreTier::Shallow), PutOutcome::Stored);
        assert_eq!(store.get(&key), Some(block));
    }

    #[test]
    fn shallow_tier_evicts_deep_does_not() {
        let store = MemoryBlockStore::new(2, 4);
        let mut rng = XorShiftRng::seed_from_u64(2);
        let pinned: KeyBlock = make_chk_block(&mut rng).into();
        store.put(pinned.clone(), StoreTier::Deep);
        let mut cached = vec![];
        for _ in 0..4 {
            let b: KeyBlock = make_chk_block(&mut rng).into();
            store.put(b.clone(), StoreTier::Shallow);
            cached.push(b);
        }
        assert_eq!(store.get(&cached[0].key()), None);
        assert_eq!(store.get(&pinned.key()), Some(pinned));
    }

    #[test]
    fn ssk_collision_keeps_first_write() {
        let store = MemoryBlockStore::default();
        let mut rng = XorShiftRng::seed_from_u64(3);
        let keypair = SubspaceKeypair::from_rng(&mut rng);
        let first: KeyBlock = make_ssk_block(&keypair, b"doc", b"v1").into();
        let second: KeyBlock = make_ssk_block(&keypair, b"doc", b"v2").into();
        assert_eq!(first.key(), second.key());
        store.put(first.clone(), StoreTier::Shallow);
        assert_matches!(
            store.put(second, StoreTier::Shallow),
            PutOutcome::Collision(stored) if stored == first
        );
    }

    #[test]
    fn pubkey_cache_roundtrip() {
        let store = MemoryBlockStore::default();
        let mut rng = XorShiftRng::seed_from_u64(4);
        let keypair = SubspaceKeypair::from_rng(&mut rng);
        let pk = keypair.public();
        assert_eq!(store.get_pubkey(&pk.hash()), None);
        store.put_pubkey(pk);
        assert_eq!(store.get_pubkey(&pk.hash()), Some(pk));
    }
}
