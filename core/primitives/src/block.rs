use crate::hash::CryptoHash;
use crate::key::Key;

/// CHK payloads are transferred in fixed-size packets; a block is always
/// exactly `PACKETS_IN_BLOCK * PACKET_SIZE` bytes of payload.
pub const PACKET_SIZE: usize = 1024;
pub const PACKETS_IN_BLOCK: usize = 32;
pub const CHK_PAYLOAD_SIZE: usize = PACKETS_IN_BLOCK * PACKET_SIZE;

/// SSK blocks are small and travel in a single message.
pub const SSK_MAX_PAYLOAD_SIZE: usize = 1024;
pub const SSK_MAX_HEADERS_SIZE: usize = 256;
pub const CHK_MAX_HEADERS_SIZE: usize = 256;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BlockValidityError {
    #[error("CHK payload must be exactly {CHK_PAYLOAD_SIZE} bytes, got {0}")]
    WrongPayloadSize(usize),
    #[error("payload too large: {got} > {max}")]
    PayloadTooLarge { got: usize, max: usize },
    #[error("headers too large: {got} > {max}")]
    HeadersTooLarge { got: usize, max: usize },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BlockVerifyError {
    #[error("content hash does not match the key")]
    HashMismatch,
    #[error("block was verified against a key of the wrong type")]
    WrongKeyType,
    #[error("subspace public key does not match the key's pubkey hash")]
    PubkeyMismatch,
    #[error("malformed subspace public key")]
    MalformedPubkey,
    #[error("subspace signature verification failed")]
    BadSignature,
}

/// An immutable content-hash block. Self-verifying: the key is the SHA-256
/// digest of `headers || payload`.
#[derive(Clone, PartialEq, Eq, Debug, borsh::BorshSerialize, borsh::BorshDeserialize)]
pub struct ChkBlock {
    headers: Vec<u8>,
    payload: Vec<u8>,
}

impl ChkBlock {
    pub fn new(headers: Vec<u8>, payload: Vec<u8>) -> Result<ChkBlock, BlockValidityError> {
        if payload.len() != CHK_PAYLOAD_SIZE {
            return Err(BlockValidityError::WrongPayloadSize(payload.len()));
        }
        if headers.len() > CHK_MAX_HEADERS_SIZE {
            return Err(BlockValidityError::HeadersTooLarge {
                got: headers.len(),
                max: CHK_MAX_HEADERS_SIZE,
            });
        }
        Ok(ChkBlock { headers, payload })
    }

    pub fn content_hash(&self) -> CryptoHash {
        CryptoHash::hash_parts(&[&self.headers, &self.payload])
    }

    pub fn key(&self) -> Key {
        Key::Chk(self.content_hash())
    }

    pub fn headers(&self) -> &[u8] {
        &self.headers
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn verify(&self, key: &Key) -> Result<(), BlockVerifyError> {
        match key {
            Key::Chk(hash) => {
                if self.content_hash() != *hash {
                    return Err(BlockVerifyError::HashMismatch);
                }
                Ok(())
            }
            Key::Ssk { .. } => Err(BlockVerifyError::WrongKeyType),
        }
    }
}

/// Ed25519 public key of a subspace. Stored and transferred as raw bytes;
/// parsed lazily at verification time.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    borsh::BorshSerialize,
    borsh::BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct SubspacePublicKey(pub [u8; 32]);

impl SubspacePublicKey {
    pub fn hash(&self) -> CryptoHash {
        CryptoHash::hash(&self.0)
    }

    pub fn verify(&self, message: &CryptoHash, signature: &[u8; 64]) -> Result<(), BlockVerifyError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| BlockVerifyError::MalformedPubkey)?;
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        key.verify_strict(message.as_bytes(), &sig).map_err(|_| BlockVerifyError::BadSignature)
    }
}

impl std::fmt::Debug for SubspacePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subspace-pk({})", hex::encode(&self.0[..8]))
    }
}

/// A mutable-subspace block: payload plus a signature binding it to the
/// (pubkey, document) slot. The signature covers the digest of all four
/// components, so neither headers nor payload can be swapped.
#[derive(Clone, PartialEq, Eq, Debug, borsh::BorshSerialize, borsh::BorshDeserialize)]
pub struct SskBlock {
    pubkey_hash: CryptoHash,
    encrypted_hash: CryptoHash,
    headers: Vec<u8>,
    payload: Vec<u8>,
    signature: [u8; 64],
}

impl SskBlock {
    pub fn new(
        pubkey_hash: CryptoHash,
        encrypted_hash: CryptoHash,
        headers: Vec<u8>,
        payload: Vec<u8>,
        signature: [u8; 64],
    ) -> Result<SskBlock, BlockValidityError> {
        if payload.len() > SSK_MAX_PAYLOAD_SIZE {
            return Err(BlockValidityError::PayloadTooLarge {
                got: payload.len(),
                max: SSK_MAX_PAYLOAD_SIZE,
            });
        }
        if headers.len() > SSK_MAX_HEADERS_SIZE {
            return Err(BlockValidityError::HeadersTooLarge {
                got: headers.len(),
                max: SSK_MAX_HEADERS_SIZE,
            });
        }
        Ok(SskBlock { pubkey_hash, encrypted_hash, headers, payload, signature })
    }

    pub fn key(&self) -> Key {
        Key::Ssk { pubkey_hash: self.pubkey_hash, encrypted_hash: self.encrypted_hash }
    }

    pub fn headers(&self) -> &[u8] {
        &self.headers
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    /// The digest the subspace key signs.
    pub fn signed_digest(&self) -> CryptoHash {
        CryptoHash::hash_parts(&[
            self.pubkey_hash.as_bytes(),
            self.encrypted_hash.as_bytes(),
            &self.headers,
            &self.payload,
        ])
    }

    pub fn verify(&self, key: &Key, pubkey: &SubspacePublicKey) -> Result<(), BlockVerifyError> {
        let Key::Ssk { pubkey_hash, encrypted_hash } = key else {
            return Err(BlockVerifyError::WrongKeyType);
        };
        if self.pubkey_hash != *pubkey_hash || self.encrypted_hash != *encrypted_hash {
            return Err(BlockVerifyError::HashMismatch);
        }
        if pubkey.hash() != *pubkey_hash {
            return Err(BlockVerifyError::PubkeyMismatch);
        }
        pubkey.verify(&self.signed_digest(), &self.signature)
    }
}

/// Either kind of block, as handed to and returned by the store.
#[derive(Clone, PartialEq, Eq, Debug, borsh::BorshSerialize, borsh::BorshDeserialize)]
pub enum KeyBlock {
    Chk(ChkBlock),
    Ssk(SskBlock),
}

impl KeyBlock {
    pub fn key(&self) -> Key {
        match self {
            KeyBlock::Chk(b) => b.key(),
            KeyBlock::Ssk(b) => b.key(),
        }
    }

    pub fn headers(&self) -> &[u8] {
        match self {
            KeyBlock::Chk(b) => b.headers(),
            KeyBlock::Ssk(b) => b.headers(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            KeyBlock::Chk(b) => b.payload(),
            KeyBlock::Ssk(b) => b.payload(),
        }
    }
}

impl From<ChkBlock> for KeyBlock {
    fn from(b: ChkBlock) -> Self {
        KeyBlock::Chk(b)
    }
}

impl From<SskBlock> for KeyBlock {
    fn from(b: SskBlock) -> Self {
        KeyBlock::Ssk(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testonly::{make_chk_block, make_ssk_block, SubspaceKeypair};
    use assert_matches::assert_matches;
    use rand::SeedableRng as _;

    #[test]
    fn chk_block_roundtrip_verifies() {
        let mut rng = rand_like();
        let block = make_chk_block(&mut rng);
        let key = block.key();
        assert_eq!(block.verify(&key), Ok(()));
    }

    #[test]
    fn chk_block_rejects_foreign_key() {
        let mut rng = rand_like();
        let block = make_chk_block(&mut rng);
        let other = make_chk_block(&mut rng);
        assert_matches!(block.verify(&other.key()), Err(BlockVerifyError::HashMismatch));
    }

    #[test]
    fn chk_payload_size_is_enforced() {
        assert_matches!(
            ChkBlock::new(vec![], vec![0; CHK_PAYLOAD_SIZE - 1]),
            Err(BlockValidityError::WrongPayloadSize(_))
        );
    }

    #[test]
    fn ssk_block_verifies_against_owner_key() {
        let mut rng = rand_like();
        let keypair = SubspaceKeypair::from_rng(&mut rng);
        let block = make_ssk_block(&keypair, b"doc", b"hello subspace");
        assert_eq!(block.verify(&block.key(), &keypair.public()), Ok(()));
    }

    #[test]
    fn ssk_block_rejects_wrong_pubkey() {
        let mut rng = rand_like();
        let owner = SubspaceKeypair::from_rng(&mut rng);
        let mallory = SubspaceKeypair::from_rng(&mut rng);
        let block = make_ssk_block(&owner, b"doc", b"hello");
        assert_matches!(
            block.verify(&block.key(), &mallory.public()),
            Err(BlockVerifyError::PubkeyMismatch)
        );
    }

    #[test]
    fn ssk_block_rejects_tampered_payload() {
        let mut rng = rand_like();
        let keypair = SubspaceKeypair::from_rng(&mut rng);
        let block = make_ssk_block(&keypair, b"doc", b"hello");
        let tampered = SskBlock::new(
            block.pubkey_hash,
            block.encrypted_hash,
            block.headers.clone(),
            b"evil!".to_vec(),
            block.signature,
        )
        .unwrap();
        assert_matches!(
            tampered.verify(&tampered.key(), &keypair.public()),
            Err(BlockVerifyError::BadSignature)
        );
    }

    fn rand_like() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(42)
    }
}
