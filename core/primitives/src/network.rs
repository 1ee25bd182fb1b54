/// Stable 64-bit identifier of a peer. Assigned randomly when the peer is
/// first learned about and never reused; cross-references between long-lived
/// structures hold a `PeerId` rather than a pointer, and resolve it through
/// the peer registry (which returns `None` once the peer is gone).
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    borsh::BorshSerialize,
    borsh::BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn random(rng: &mut impl rand::Rng) -> PeerId {
        PeerId(rng.r#gen())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer({:016x})", self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// Per-request identifier chosen at random by the originator and carried
/// unchanged through every hop.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    borsh::BorshSerialize,
    borsh::BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Uid(pub u64);

impl Uid {
    pub fn random(rng: &mut impl rand::Rng) -> Uid {
        Uid(rng.r#gen())
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "uid({:016x})", self.0)
    }
}

impl std::fmt::Debug for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
