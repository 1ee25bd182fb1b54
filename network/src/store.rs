//! Persistence glue: failure-table entries and known-peer records, flushed
//! periodically and reloaded at startup. All rows are borsh-encoded.

use crate::failure_table::PersistedFailureEntry;
use gyre_primitives::network::PeerId;
use gyre_store::{DBCol, Database};
use std::sync::Arc;

/// Last known facts about a peer, enough to re-add it after a restart.
#[derive(Clone, Debug, PartialEq, borsh::BorshSerialize, borsh::BorshDeserialize)]
pub struct KnownPeerRecord {
    pub peer_id: PeerId,
    pub addr: String,
    /// Location as raw f64 bits; absent if never learned.
    pub location_bits: Option<u64>,
    pub boot_id: u64,
}

#[derive(Clone)]
pub(crate) struct NetStore(Arc<dyn Database>);

impl NetStore {
    pub fn new(db: Arc<dyn Database>) -> NetStore {
        NetStore(db)
    }

    /// Replaces the persisted failure entries with the given snapshot.
    pub fn replace_failure_entries(
        &self,
        entries: &[PersistedFailureEntry],
    ) -> Result<(), gyre_store::Error> {
        for (key, _) in self.0.iter(DBCol::FailureEntries)? {
            self.0.delete(DBCol::FailureEntries, &key)?;
        }
        for entry in entries {
            let row_key = entry.key.routing_hash();
            let value = borsh::to_vec(entry).expect("serialization into a Vec cannot fail");
            self.0.set(DBCol::FailureEntries, row_key.as_bytes(), &value)?;
        }
        Ok(())
    }

    pub fn load_failure_entries(&self) -> Result<Vec<PersistedFailureEntry>, gyre_store::Error> {
        let mut entries = Vec::new();
        for (row_key, value) in self.0.iter(DBCol::FailureEntries)? {
            match borsh::from_slice(&value) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(target: "network::store", ?row_key, ?err, "dropping corrupt failure entry");
                }
            }
        }
        Ok(entries)
    }

    pub fn set_known_peer(&self, record: &KnownPeerRecord) -> Result<(), gyre_store::Error> {
        let value = borsh::to_vec(record).expect("serialization into a Vec cannot fail");
        self.0.set(DBCol::KnownPeers, &record.peer_id.0.to_be_bytes(), &value)?;
        Ok(())
    }

    pub fn load_known_peers(&self) -> Result<Vec<KnownPeerRecord>, gyre_store::Error> {
        let mut peers = Vec::new();
        for (_, value) in self.0.iter(DBCol::KnownPeers)? {
            match borsh::from_slice(&value) {
                Ok(record) => peers.push(record),
                Err(err) => {
                    tracing::warn!(target: "network::store", ?err, "dropping corrupt peer record");
                }
            }
        }
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_primitives::hash::CryptoHash;
    use gyre_primitives::key::Key;
    use gyre_store::TestDB;

    #[test]
    fn failure_entries_replace_and_load() {
        let store = NetStore::new(TestDB::new());
        let entry = |tag: u8, ms: u32| PersistedFailureEntry {
            key: Key::Chk(CryptoHash::hash(&[tag])),
            time_left_ms: ms,
        };
        store.replace_failure_entries(&[entry(1, 100), entry(2, 200)]).unwrap();
        assert_eq!(store.load_failure_entries().unwrap().len(), 2);
        // Replacement drops entries absent from the new snapshot.
        store.replace_failure_entries(&[entry(3, 300)]).unwrap();
        let loaded = store.load_failure_entries().unwrap();
        assert_eq!(loaded, vec![entry(3, 300)]);
    }

    #[test]
    fn known_peers_roundtrip() {
        let store = NetStore::new(TestDB::new());
        let record = KnownPeerRecord {
            peer_id: PeerId(42),
            addr: "127.0.0.1:4100".to_string(),
            location_bits: Some(0.25f64.to_bits()),
            boot_id: 7,
        };
        store.set_known_peer(&record).unwrap();
        assert_eq!(store.load_known_peers().unwrap(), vec![record]);
    }
}
