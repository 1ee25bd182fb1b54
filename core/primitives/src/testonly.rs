//! Test helpers. Not gated on cfg(test) because downstream crates use them in
//! their own tests.

use crate::block::{ChkBlock, SskBlock, SubspacePublicKey, CHK_PAYLOAD_SIZE};
use crate::hash::CryptoHash;
use ed25519_dalek::Signer as _;
use rand::Rng;

/// An owning subspace keypair, for minting signed SSK blocks in tests.
pub struct SubspaceKeypair {
    signing: ed25519_dalek::SigningKey,
}

impl SubspaceKeypair {
    pub fn from_rng(rng: &mut impl rand::RngCore) -> SubspaceKeypair {
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        SubspaceKeypair { signing: ed25519_dalek::SigningKey::from_bytes(&secret) }
    }

    pub fn public(&self) -> SubspacePublicKey {
        SubspacePublicKey(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, digest: &CryptoHash) -> [u8; 64] {
        self.signing.sign(digest.as_bytes()).to_bytes()
    }
}

/// A CHK block over random payload.
pub fn make_chk_block(rng: &mut impl Rng) -> ChkBlock {
    let mut payload = vec![0u8; CHK_PAYLOAD_SIZE];
    rng.fill(&mut payload[..]);
    let headers: Vec<u8> = (0..32).map(|_| rng.r#gen()).collect();
    ChkBlock::new(headers, payload).unwrap()
}

/// A signed SSK block in `keypair`'s subspace, at the slot named by `docname`.
pub fn make_ssk_block(keypair: &SubspaceKeypair, docname: &[u8], payload: &[u8]) -> SskBlock {
    let pubkey_hash = keypair.public().hash();
    let encrypted_hash = CryptoHash::hash(docname);
    // Assemble once unsigned to compute the digest, then attach the signature.
    let unsigned = SskBlock::new(
        pubkey_hash,
        encrypted_hash,
        b"ssk-headers".to_vec(),
        payload.to_vec(),
        [0; 64],
    )
    .unwrap();
    let signature = keypair.sign(&unsigned.signed_digest());
    SskBlock::new(pubkey_hash, encrypted_hash, b"ssk-headers".to_vec(), payload.to_vec(), signature)
        .unwrap()
}
