use crate::hash::CryptoHash;
use crate::location::Location;

/// A fetchable key. Content-hash keys (CHK) name immutable data by its
/// SHA-256 digest and are self-verifying. Signed subspace keys (SSK) name a
/// slot in a keypair-owned subspace; a returned block must carry a valid
/// signature from the subspace key, so fetching one may additionally require
/// the subspace public key.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Debug,
    borsh::BorshSerialize,
    borsh::BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum Key {
    Chk(CryptoHash),
    Ssk { pubkey_hash: CryptoHash, encrypted_hash: CryptoHash },
}

impl Key {
    /// The hash requests are routed by. For SSKs both components contribute,
    /// so two documents in one subspace land at unrelated locations.
    pub fn routing_hash(&self) -> CryptoHash {
        match self {
            Key::Chk(hash) => *hash,
            Key::Ssk { pubkey_hash, encrypted_hash } => {
                CryptoHash::hash_parts(&[pubkey_hash.as_bytes(), encrypted_hash.as_bytes()])
            }
        }
    }

    pub fn location(&self) -> Location {
        Location::from_hash(&self.routing_hash())
    }

    pub fn is_ssk(&self) -> bool {
        matches!(self, Key::Ssk { .. })
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Chk(hash) => write!(f, "chk:{}", hash),
            Key::Ssk { pubkey_hash, encrypted_hash } => {
                write!(f, "ssk:{}:{}", pubkey_hash, encrypted_hash)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssk_routing_hash_mixes_both_components() {
        let a = CryptoHash::hash(b"pub");
        let b = CryptoHash::hash(b"doc1");
        let c = CryptoHash::hash(b"doc2");
        let k1 = Key::Ssk { pubkey_hash: a, encrypted_hash: b };
        let k2 = Key::Ssk { pubkey_hash: a, encrypted_hash: c };
        assert_ne!(k1.routing_hash(), k2.routing_hash());
        assert_ne!(k1.routing_hash(), a);
    }

    #[test]
    fn chk_routes_by_its_own_hash() {
        let h = CryptoHash::hash(b"content");
        assert_eq!(Key::Chk(h).routing_hash(), h);
        assert_eq!(Key::Chk(h).location(), Location::from_hash(&h));
    }
}
