//! Opennet path-folding hook. Only the interface is defined here: after a
//! successful fetch the originator may exchange a noderef with the terminal
//! node and decide whether to adopt it as a peer. The opennet manager
//! implementing the policy lives outside this crate.

use gyre_primitives::network::{PeerId, Uid};

/// What to do with a noderef offered from downstream.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NoderefDecision {
    /// Adopt the node into the opennet peer set.
    Add,
    /// Pass the offer upstream so another node on the chain may take it.
    RelayUpstream,
    Ignore,
}

pub trait OpennetHooks: Send + Sync {
    /// Called at the originator once a request finishes `Success`, with the
    /// peer the data came from.
    fn on_request_success(&self, _uid: Uid, _data_source: PeerId) {}

    /// Called when a downstream node offers its noderef on a completed
    /// request path.
    fn on_noderef_offered(&self, _uid: Uid, _from: PeerId, _noderef: &[u8]) -> NoderefDecision {
        NoderefDecision::Ignore
    }
}

/// Default: path folding disabled.
pub struct NoopOpennet;

impl OpennetHooks for NoopOpennet {}
