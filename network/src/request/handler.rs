//! Serves an accepted incoming data request: local store probe first, then a
//! forwarding `RequestSender`, then the terminal relay upstream. Everything
//! except `RejectedOverload` collapses into a single terminal reply here.

use crate::network_protocol::{Key, Message};
use crate::peer::PeerNode;
use crate::request::{block_transfer, sender::RequestSender};
use crate::state::NetworkState;
use crate::transport::Priority;
use crate::types::Status;
use crate::uid_registry::UidLock;
use gyre_primitives::block::KeyBlock;
use gyre_primitives::network::Uid;
use std::sync::Arc;

pub(crate) async fn run(
    state: Arc<NetworkState>,
    from: Arc<PeerNode>,
    lock: UidLock,
    key: Key,
    htl: u8,
    need_pubkey: bool,
) {
    let uid = lock.uid();
    if let Some(block) = state.store.get(&key) {
        tracing::debug!(target: "network", %uid, %key, "served from local store");
        serve_block(&state, &from, uid, block, need_pubkey);
        return;
    }

    // A live negative-cache entry answers immediately with the remaining
    // blackout; the requestor is recorded so it hears an offer if the key
    // turns up.
    if let Some(time_left) = state.failure_table.recently_failed(&key) {
        let time_left_ms = time_left.whole_milliseconds().clamp(0, u32::MAX as i128) as u32;
        state.failure_table.on_final_failure(key, None, htl, time_left, Some(from.id));
        state.send_to_peer(&from, Message::RecentlyFailed { uid, time_left_ms }, Priority::High);
        return;
    }

    let outcome = RequestSender::new(state.clone(), uid, key, htl, Some(from.id), false)
        .run()
        .await;
    match outcome.status {
        Status::Success => match outcome.block {
            Some(block) => serve_block(&state, &from, uid, block, need_pubkey),
            None => {
                tracing::error!(target: "network", %uid, "success without a block");
                state.send_to_peer(&from, Message::DataNotFound { uid }, Priority::High);
            }
        },
        Status::RouteNotFound => {
            state.send_to_peer(
                &from,
                Message::RouteNotFound { uid, htl: outcome.final_htl },
                Priority::High,
            );
        }
        Status::RecentlyFailed => {
            let time_left_ms = outcome
                .time_left
                .map_or(0, |d| d.whole_milliseconds().clamp(0, u32::MAX as i128) as u32);
            state.send_to_peer(
                &from,
                Message::RecentlyFailed { uid, time_left_ms },
                Priority::High,
            );
        }
        // DataNotFound, Timeout, VerifyFailure, TransferFailed, the offer
        // statuses: the upstream only learns the data is not coming.
        _ => {
            state.send_to_peer(&from, Message::DataNotFound { uid }, Priority::High);
        }
    }
    // The UID lock drops here, after all consequent sends were issued.
    drop(lock);
}

/// Replies with a locally held block: headers + packet stream for CHKs, the
/// (pubkey +) single data message for SSKs.
pub(crate) fn serve_block(
    state: &NetworkState,
    peer: &PeerNode,
    uid: Uid,
    block: KeyBlock,
    need_pubkey: bool,
) {
    match block {
        KeyBlock::Chk(block) => {
            state.send_to_peer(
                peer,
                Message::ChkDataFound { uid, headers: block.headers().to_vec() },
                Priority::Normal,
            );
            block_transfer::send_block(state, peer, uid, block.payload());
        }
        KeyBlock::Ssk(block) => {
            if need_pubkey {
                if let Key::Ssk { pubkey_hash, .. } = block.key() {
                    match state.store.get_pubkey(&pubkey_hash) {
                        Some(pubkey) => {
                            state.send_to_peer(
                                peer,
                                Message::SskPubKey { uid, pubkey },
                                Priority::Normal,
                            );
                        }
                        None => {
                            tracing::warn!(target: "network", %uid, "pubkey requested but not cached");
                        }
                    }
                }
            }
            state.send_to_peer(
                peer,
                Message::SskDataFound {
                    uid,
                    headers: block.headers().to_vec(),
                    data: block.payload().to_vec(),
                    signature: *block.signature(),
                },
                Priority::Normal,
            );
        }
    }
}
