use gyre_async::time;
use gyre_primitives::block::{KeyBlock, SubspacePublicKey};
use gyre_primitives::network::PeerId;

/// Terminal status of a request or insert. Exactly one of these (other than
/// `NotFinished`) is reported per request, before its UID is unlocked.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::IntoStaticStr)]
pub enum Status {
    NotFinished,
    Success,
    RouteNotFound,
    DataNotFound,
    TransferFailed,
    VerifyFailure,
    Timeout,
    GeneratedRejectedOverload,
    RecentlyFailed,
    InternalError,
    GetOfferVerifyFailure,
    GetOfferTransferFailed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        *self != Status::NotFinished
    }
}

/// What a finished request hands back to its owner (the local fetch API or
/// the handler relaying the result upstream).
#[derive(Debug)]
pub struct RequestOutcome {
    pub status: Status,
    pub block: Option<KeyBlock>,
    pub pubkey: Option<SubspacePublicKey>,
    /// Adjusted remaining blackout, for `RecentlyFailed`.
    pub time_left: Option<time::Duration>,
    /// HTL at termination, relayed in `RouteNotFound` replies.
    pub final_htl: u8,
    /// The peer the data ultimately came from, for opennet path folding.
    pub data_source: Option<PeerId>,
}

impl RequestOutcome {
    pub fn failed(status: Status, final_htl: u8) -> RequestOutcome {
        RequestOutcome {
            status,
            block: None,
            pubkey: None,
            time_left: None,
            final_htl,
            data_source: None,
        }
    }
}

#[derive(Debug)]
pub struct InsertOutcome {
    pub status: Status,
}

/// Waiting for a message class timed out.
#[derive(thiserror::Error, Clone, Copy, PartialEq, Eq, Debug)]
#[error("timed out waiting for a message")]
pub struct WaitTimeout;
