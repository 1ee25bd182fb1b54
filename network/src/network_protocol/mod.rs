//! Wire format. Everything on the wire is borsh-encoded; enum discriminants
//! are part of the protocol, so variants must never be reordered, only
//! appended.

use gyre_primitives::block::SubspacePublicKey;
use gyre_primitives::hash::CryptoHash;
pub use gyre_primitives::key::Key;
use gyre_primitives::location::Location;
use gyre_primitives::network::Uid;

/// Maximum encoded size of one datagram. Anything larger than this is sent
/// alone rather than coalesced; a single message must always fit.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Why an insert hop gave up.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, borsh::BorshSerialize, borsh::BorshDeserialize,
    strum::IntoStaticStr,
)]
pub enum InsertRejectReason {
    VerifyFailure,
    ReceiveFailed,
    Timeout,
}

/// Reason a `GetOfferedKey` was turned down.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, borsh::BorshSerialize, borsh::BorshDeserialize,
    strum::IntoStaticStr,
)]
pub enum OfferRejectReason {
    BadAuthenticator,
    NoSuchKey,
}

/// Payload messages carried inside datagrams.
///
/// Requests and inserts carry the full routing envelope (uid, htl); replies
/// carry only the uid and are demultiplexed to the in-flight state machine.
#[derive(Clone, PartialEq, Debug, borsh::BorshSerialize, borsh::BorshDeserialize,
    strum::IntoStaticStr)]
pub enum Message {
    // Handled inline by the dispatcher.
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Void,
    Disconnect,
    LocationChanged { location: Location },

    // Data requests.
    ChkDataRequest { uid: Uid, htl: u8, key: CryptoHash },
    SskDataRequest { uid: Uid, htl: u8, pubkey_hash: CryptoHash, encrypted_hash: CryptoHash, need_pubkey: bool },
    Accepted { uid: Uid },
    RejectedLoop { uid: Uid },
    RejectedOverload { uid: Uid, is_local: bool },
    RouteNotFound { uid: Uid, htl: u8 },
    DataNotFound { uid: Uid },
    RecentlyFailed { uid: Uid, time_left_ms: u32 },
    ChkDataFound { uid: Uid, headers: Vec<u8> },
    /// One fixed-size slice of a CHK payload, following `ChkDataFound` or
    /// `DataInsert`.
    BlockPacket { uid: Uid, index: u8, data: Vec<u8> },
    SskDataFound { uid: Uid, headers: Vec<u8>, data: Vec<u8>, signature: [u8; 64] },
    SskPubKey { uid: Uid, pubkey: SubspacePublicKey },

    // Offered keys.
    OfferKey { key: Key, authenticator: [u8; 32], expiry_ms: u32 },
    GetOfferedKey { uid: Uid, key: Key, authenticator: [u8; 32], need_pubkey: bool },
    GetOfferedKeyInvalid { uid: Uid, reason: OfferRejectReason },

    // Inserts.
    ChkInsertRequest { uid: Uid, htl: u8, key: CryptoHash },
    SskInsertRequest { uid: Uid, htl: u8, headers: Vec<u8>, data: Vec<u8>, signature: [u8; 64], pubkey: SubspacePublicKey, encrypted_hash: CryptoHash },
    DataInsert { uid: Uid, headers: Vec<u8> },
    InsertReply { uid: Uid },

    // Opennet path folding.
    OpennetNoderef { uid: Uid, noderef: Vec<u8> },

    /// Insert terminated without storing (distinct from `InsertReply`, which
    /// confirms the chain stored the block).
    InsertFailed { uid: Uid, reason: InsertRejectReason },
}

impl Message {
    /// The request this message belongs to, if it is uid-routed.
    pub fn uid(&self) -> Option<Uid> {
        match self {
            Message::Ping { .. }
            | Message::Pong { .. }
            | Message::Void
            | Message::Disconnect
            | Message::LocationChanged { .. }
            | Message::OfferKey { .. } => None,
            Message::ChkDataRequest { uid, .. }
            | Message::SskDataRequest { uid, .. }
            | Message::Accepted { uid }
            | Message::RejectedLoop { uid }
            | Message::RejectedOverload { uid, .. }
            | Message::RouteNotFound { uid, .. }
            | Message::DataNotFound { uid }
            | Message::RecentlyFailed { uid, .. }
            | Message::ChkDataFound { uid, .. }
            | Message::BlockPacket { uid, .. }
            | Message::SskDataFound { uid, .. }
            | Message::SskPubKey { uid, .. }
            | Message::GetOfferedKey { uid, .. }
            | Message::GetOfferedKeyInvalid { uid, .. }
            | Message::ChkInsertRequest { uid, .. }
            | Message::SskInsertRequest { uid, .. }
            | Message::DataInsert { uid, .. }
            | Message::InsertReply { uid }
            | Message::OpennetNoderef { uid, .. }
            | Message::InsertFailed { uid, .. } => Some(*uid),
        }
    }
}

/// Acks for up to 32 seqnos immediately below `base`: bit `i` set means
/// `base - 1 - i` has been received.
#[derive(Clone, Copy, PartialEq, Eq, Debug, borsh::BorshSerialize, borsh::BorshDeserialize)]
pub struct AckBitmask {
    pub base: u32,
    pub bits: u32,
}

impl AckBitmask {
    pub fn seqnos(&self) -> impl Iterator<Item = u32> + '_ {
        (0..32u32).filter(|i| self.bits & (1 << i) != 0).map(|i| self.base.wrapping_sub(1 + i))
    }
}

/// Transport bookkeeping carried in every datagram, outside the payload
/// messages. A datagram with payload carries a seqno and participates in the
/// reliability protocol; bookkeeping-only datagrams do not.
#[derive(Clone, PartialEq, Eq, Debug, Default, borsh::BorshSerialize, borsh::BorshDeserialize)]
pub struct PacketHeader {
    pub seqno: Option<u32>,
    pub acks: Vec<u32>,
    pub ack_bitmask: Option<AckBitmask>,
    pub resend_requests: Vec<u32>,
    pub ack_requests: Vec<u32>,
    pub forgotten: Vec<u32>,
}

impl PacketHeader {
    pub fn is_empty(&self) -> bool {
        self.seqno.is_none()
            && self.acks.is_empty()
            && self.ack_bitmask.is_none()
            && self.resend_requests.is_empty()
            && self.ack_requests.is_empty()
            && self.forgotten.is_empty()
    }
}

#[derive(Clone, PartialEq, Debug, borsh::BorshSerialize, borsh::BorshDeserialize)]
pub struct Datagram {
    pub header: PacketHeader,
    pub messages: Vec<Message>,
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("datagram too large: {0} bytes")]
    TooLarge(usize),
    #[error("malformed datagram: {0}")]
    Malformed(#[from] std::io::Error),
}

impl Datagram {
    pub fn encode(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("serialization into a Vec cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Datagram, ParseError> {
        if bytes.len() > 4 * MAX_DATAGRAM_SIZE {
            return Err(ParseError::TooLarge(bytes.len()));
        }
        Ok(borsh::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_primitives::network::Uid;
    use pretty_assertions::assert_eq;

    #[test]
    fn datagram_roundtrip() {
        let datagram = Datagram {
            header: PacketHeader {
                seqno: Some(7),
                acks: vec![1, 2],
                ack_bitmask: Some(AckBitmask { base: 40, bits: 0b101 }),
                resend_requests: vec![3],
                ack_requests: vec![5],
                forgotten: vec![],
            },
            messages: vec![
                Message::Ping { nonce: 99 },
                Message::ChkDataRequest {
                    uid: Uid(1),
                    htl: 18,
                    key: CryptoHash::hash(b"x"),
                },
            ],
        };
        let decoded = Datagram::decode(&datagram.encode()).unwrap();
        assert_eq!(decoded, datagram);
    }

    #[test]
    fn ack_bitmask_expands_below_base() {
        let mask = AckBitmask { base: 40, bits: 0b101 };
        assert_eq!(mask.seqnos().collect::<Vec<_>>(), vec![39, 37]);
        // Wraps through zero.
        let mask = AckBitmask { base: 1, bits: 0b11 };
        assert_eq!(mask.seqnos().collect::<Vec<_>>(), vec![0, u32::MAX]);
    }

    /// Discriminants are wire-stable; this pins a couple of encodings so an
    /// accidental variant reorder fails loudly.
    #[test]
    fn message_encoding_compatibility_smoke_test() {
        #[track_caller]
        fn check(msg: Message, expected_prefix: &[u8]) {
            let bytes = borsh::to_vec(&msg).unwrap();
            assert_eq!(&bytes[..expected_prefix.len()], expected_prefix);
        }
        check(Message::Ping { nonce: 1 }, &[0, 1, 0, 0, 0, 0, 0, 0, 0]);
        check(Message::Accepted { uid: Uid(2) }, &[7, 2, 0, 0, 0, 0, 0, 0, 0]);
        check(Message::InsertReply { uid: Uid(3) }, &[23, 3, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn empty_header_is_empty() {
        assert!(PacketHeader::default().is_empty());
        let header = PacketHeader { seqno: Some(0), ..Default::default() };
        assert!(!header.is_empty());
    }
}
