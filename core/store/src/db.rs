use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Columns of the node's persistent key-value storage. Think of the storage
/// as a 2-dimensional table with (column, key) as coordinates. Variant names
/// map to on-disk column families, so renaming one is a migration.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Debug, Hash, strum::EnumIter, strum::IntoStaticStr)]
pub enum DBCol {
    /// Version of the database layout.
    /// - *Rows*: single row `"VERSION"`
    /// - *Content type*: u32
    DbVersion,
    /// Recently failed keys, so a restart does not forget active blackouts.
    /// - *Rows*: routing hash of the key
    /// - *Content type*: serialized failure-table entry
    FailureEntries,
    /// Last known location and session material per peer.
    /// - *Rows*: peer id (u64 BE)
    /// - *Content type*: serialized known-peer record
    KnownPeers,
    /// Deep-store blocks (written on inserts).
    /// - *Rows*: routing hash of the key
    /// - *Content type*: serialized block
    Blocks,
    /// Cached subspace public keys.
    /// - *Rows*: pubkey hash
    /// - *Content type*: 32 raw key bytes
    PubKeys,
}

/// Storage backend. Synchronous; implementations provide their own
/// durability. Keys are opaque bytes within a column.
pub trait Database: Send + Sync {
    fn get(&self, col: DBCol, key: &[u8]) -> std::io::Result<Option<Vec<u8>>>;
    fn set(&self, col: DBCol, key: &[u8], value: &[u8]) -> std::io::Result<()>;
    fn delete(&self, col: DBCol, key: &[u8]) -> std::io::Result<()>;
    /// Full scan of a column, in key order.
    fn iter(&self, col: DBCol) -> std::io::Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory `Database`, used in tests and as the default backend until a
/// persistent one is configured.
#[derive(Default)]
pub struct TestDB {
    cols: RwLock<BTreeMap<(DBCol, Vec<u8>), Vec<u8>>>,
}

impl TestDB {
    pub fn new() -> Arc<TestDB> {
        Arc::new(TestDB::default())
    }
}

impl Database for TestDB {
    fn get(&self, col: DBCol, key: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.cols.read().get(&(col, key.to_vec())).cloned())
    }

    fn set(&self, col: DBCol, key: &[u8], value: &[u8]) -> std::io::Result<()> {
        self.cols.write().insert((col, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, col: DBCol, key: &[u8]) -> std::io::Result<()> {
        self.cols.write().remove(&(col, key.to_vec()));
        Ok(())
    }

    fn iter(&self, col: DBCol) -> std::io::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .cols
            .read()
            .range((col, vec![])..)
            .take_while(|((c, _), _)| *c == col)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let db = TestDB::new();
        db.set(DBCol::KnownPeers, b"a", b"1").unwrap();
        assert_eq!(db.get(DBCol::KnownPeers, b"a").unwrap(), Some(b"1".to_vec()));
        // Columns are independent.
        assert_eq!(db.get(DBCol::Blocks, b"a").unwrap(), None);
        db.delete(DBCol::KnownPeers, b"a").unwrap();
        assert_eq!(db.get(DBCol::KnownPeers, b"a").unwrap(), None);
    }

    #[test]
    fn iter_is_per_column_and_ordered() {
        let db = TestDB::new();
        db.set(DBCol::Blocks, b"b", b"2").unwrap();
        db.set(DBCol::Blocks, b"a", b"1").unwrap();
        db.set(DBCol::PubKeys, b"z", b"9").unwrap();
        let rows = db.iter(DBCol::Blocks).unwrap();
        assert_eq!(rows, vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]);
    }
}
