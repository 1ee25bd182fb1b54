//! HTL-routed inserts. Each hop on the chain verifies the block, commits it
//! to the deep store, and routes onward until HTL exhausts; `InsertReply`
//! confirms the chain back to the originator.

use crate::network_protocol::{InsertRejectReason, Key, Message};
use crate::peer::{selector, PeerNode};
use crate::request::block_transfer;
use crate::state::NetworkState;
use crate::transport::Priority;
use crate::types::{InsertOutcome, Status};
use crate::uid_registry::{UidKind, UidLock};
use crate::waiters::Subscription;
use gyre_primitives::block::{ChkBlock, KeyBlock, SskBlock, SubspacePublicKey};
use gyre_primitives::hash::CryptoHash;
use gyre_primitives::network::{PeerId, Uid};
use gyre_store::block_store::{PutOutcome, StoreTier};
use std::collections::HashSet;
use std::sync::Arc;

/// Body of an accepted incoming insert, as parsed by the dispatcher.
pub(crate) enum IncomingInsert {
    Chk {
        key: CryptoHash,
    },
    Ssk {
        headers: Vec<u8>,
        data: Vec<u8>,
        signature: [u8; 64],
        pubkey: SubspacePublicKey,
        encrypted_hash: CryptoHash,
    },
}

pub(crate) async fn run_handler(
    state: Arc<NetworkState>,
    from: Arc<PeerNode>,
    lock: UidLock,
    htl: u8,
    body: IncomingInsert,
    mut sub: Subscription,
) {
    let uid = lock.uid();
    match body {
        IncomingInsert::Chk { key } => {
            run_chk_handler(&state, &from, uid, htl, key, &mut sub).await;
        }
        IncomingInsert::Ssk { headers, data, signature, pubkey, encrypted_hash } => {
            run_ssk_handler(&state, &from, uid, htl, headers, data, signature, pubkey, encrypted_hash, &mut sub)
                .await;
        }
    }
    drop(lock);
}

async fn run_chk_handler(
    state: &Arc<NetworkState>,
    from: &Arc<PeerNode>,
    uid: Uid,
    htl: u8,
    key: CryptoHash,
    sub: &mut Subscription,
) {
    let clock = state.clock.clone();
    let config = state.config.get();
    let deadline = clock.now() + config.accepted_timeout();
    let headers = loop {
        match sub.recv_until(&clock, deadline).await {
            Err(_) => {
                state.send_to_peer(
                    from,
                    Message::InsertFailed { uid, reason: InsertRejectReason::Timeout },
                    Priority::High,
                );
                return;
            }
            Ok((sender, Message::DataInsert { headers, .. })) if sender == from.id => break headers,
            Ok(_) => continue,
        }
    };
    let received = block_transfer::receive_block(
        sub,
        &clock,
        from.id,
        config.block_transfer_packet_timeout(),
        |_, _| {},
    )
    .await;
    let Ok(payload) = received else {
        state.send_to_peer(
            from,
            Message::InsertFailed { uid, reason: InsertRejectReason::ReceiveFailed },
            Priority::High,
        );
        return;
    };
    let block = match ChkBlock::new(headers, payload) {
        Ok(block) if block.content_hash() == key => block,
        // Either malformed or the content does not hash to the key it was
        // inserted under.
        _ => {
            state.send_to_peer(
                from,
                Message::InsertFailed { uid, reason: InsertRejectReason::VerifyFailure },
                Priority::High,
            );
            return;
        }
    };
    let block = KeyBlock::Chk(block);
    state.commit_block(block.clone(), StoreTier::Deep);
    forward_and_reply(state, from, uid, block, None, htl, sub).await;
}

#[allow(clippy::too_many_arguments)]
async fn run_ssk_handler(
    state: &Arc<NetworkState>,
    from: &Arc<PeerNode>,
    uid: Uid,
    htl: u8,
    headers: Vec<u8>,
    data: Vec<u8>,
    signature: [u8; 64],
    pubkey: SubspacePublicKey,
    encrypted_hash: CryptoHash,
    sub: &mut Subscription,
) {
    let block = match SskBlock::new(pubkey.hash(), encrypted_hash, headers, data, signature) {
        Ok(block) => block,
        Err(_) => {
            state.send_to_peer(
                from,
                Message::InsertFailed { uid, reason: InsertRejectReason::VerifyFailure },
                Priority::High,
            );
            return;
        }
    };
    if block.verify(&block.key(), &pubkey).is_err() {
        state.send_to_peer(
            from,
            Message::InsertFailed { uid, reason: InsertRejectReason::VerifyFailure },
            Priority::High,
        );
        return;
    }
    state.store.put_pubkey(pubkey);
    let block = KeyBlock::Ssk(block);
    match state.commit_block(block.clone(), StoreTier::Deep) {
        PutOutcome::Collision(stored) => {
            // First write wins; the inserter learns the surviving value and
            // the insert still counts as placed.
            if let KeyBlock::Ssk(stored) = stored {
                state.send_to_peer(
                    from,
                    Message::SskDataFound {
                        uid,
                        headers: stored.headers().to_vec(),
                        data: stored.payload().to_vec(),
                        signature: *stored.signature(),
                    },
                    Priority::Normal,
                );
            }
            state.send_to_peer(from, Message::InsertReply { uid }, Priority::High);
        }
        _ => {
            forward_and_reply(state, from, uid, block, Some(pubkey), htl, sub).await;
        }
    }
}

/// Routes the insert onward (if HTL remains) and confirms upstream. The
/// local commit already happened, so the reply is a confirmation regardless
/// of how far downstream got.
async fn forward_and_reply(
    state: &Arc<NetworkState>,
    from: &Arc<PeerNode>,
    uid: Uid,
    block: KeyBlock,
    pubkey: Option<SubspacePublicKey>,
    htl: u8,
    sub: &mut Subscription,
) {
    let new_htl = state.decrement_htl(Some(from.as_ref()), htl);
    if new_htl > 0 {
        let outcome =
            InsertSender::new(state.clone(), uid, block, pubkey, new_htl, Some(from.id))
                .run(sub)
                .await;
        tracing::debug!(target: "network", %uid, status = <&'static str>::from(outcome.status), "insert forwarding finished");
    }
    state.send_to_peer(from, Message::InsertReply { uid }, Priority::High);
}

/// Routes an insert toward the key's location, one accepted hop at a time.
pub(crate) struct InsertSender {
    state: Arc<NetworkState>,
    uid: Uid,
    block: KeyBlock,
    pubkey: Option<SubspacePublicKey>,
    htl: u8,
    source: Option<PeerId>,
    visited: HashSet<PeerId>,
    has_forwarded: bool,
    last_next: Option<PeerId>,
    forwarded_overload: bool,
}

impl InsertSender {
    pub fn new(
        state: Arc<NetworkState>,
        uid: Uid,
        block: KeyBlock,
        pubkey: Option<SubspacePublicKey>,
        htl: u8,
        source: Option<PeerId>,
    ) -> InsertSender {
        InsertSender {
            state,
            uid,
            block,
            pubkey,
            htl,
            source,
            visited: HashSet::new(),
            has_forwarded: false,
            last_next: None,
            forwarded_overload: false,
        }
    }

    pub async fn run(mut self, sub: &mut Subscription) -> InsertOutcome {
        let clock = self.state.clock.clone();
        let deadline = self.state.config.get().overall_deadline();
        let uid = self.uid;
        let inner = self.run_inner(sub);
        tokio::pin!(inner);
        tokio::select! {
            outcome = &mut inner => outcome,
            _ = clock.sleep(deadline) => {
                tracing::error!(target: "network", %uid, "insert missed its overall deadline");
                InsertOutcome { status: Status::InternalError }
            }
        }
    }

    async fn run_inner(&mut self, sub: &mut Subscription) -> InsertOutcome {
        let clock = self.state.clock.clone();
        let key = self.block.key();
        let target = key.location();
        let mut skip_decrement = false;
        loop {
            let config = self.state.config.get();
            if !skip_decrement {
                let coin_peer = if self.has_forwarded {
                    self.last_next.and_then(|id| self.state.peers.get(&id))
                } else {
                    self.source.and_then(|id| self.state.peers.get(&id))
                };
                self.htl = self.state.decrement_htl(coin_peer.as_deref(), self.htl);
            }
            skip_decrement = false;

            if self.htl == 0 {
                // The chain is as deep as it gets; the block sits on every
                // hop that accepted it.
                return InsertOutcome { status: Status::Success };
            }

            let Some(next) = selector::closer_peer(
                &self.state.peers,
                &clock,
                self.source,
                &self.visited,
                &HashSet::new(),
                target,
                None,
                None,
            ) else {
                return InsertOutcome { status: Status::RouteNotFound };
            };
            self.visited.insert(next.id);

            let request = self.request_message();
            if self.state.send_to_peer_now(&next, request, Priority::High).await.is_err() {
                self.state.failure_table.on_failed(&key, &next, self.htl, "send failed");
                continue;
            }
            self.has_forwarded = true;
            self.last_next = Some(next.id);

            let mut pending = None;
            let accept_deadline = clock.now() + config.accepted_timeout();
            let accepted = loop {
                let Ok((from, message)) = sub.recv_until(&clock, accept_deadline).await else {
                    self.state.failure_table.on_failed(&key, &next, self.htl, "accept timeout");
                    break false;
                };
                if from != next.id {
                    continue;
                }
                match message {
                    Message::Accepted { .. } => break true,
                    Message::RejectedLoop { .. } => {
                        self.state.failure_table.on_failed(&key, &next, self.htl, "rejected loop");
                        break false;
                    }
                    Message::RejectedOverload { is_local: true, .. } => {
                        self.state.failure_table.on_failed(&key, &next, self.htl, "local overload");
                        break false;
                    }
                    Message::RejectedOverload { is_local: false, .. } => {
                        self.forward_overload_upstream();
                    }
                    other => {
                        pending = Some(other);
                        break true;
                    }
                }
            };
            if !accepted {
                continue;
            }

            if let KeyBlock::Chk(block) = &self.block {
                self.state.send_to_peer(
                    &next,
                    Message::DataInsert { uid: self.uid, headers: block.headers().to_vec() },
                    Priority::Normal,
                );
                block_transfer::send_block(&self.state, &next, self.uid, block.payload());
            }

            let reply_deadline = clock.now() + config.fetch_timeout();
            loop {
                let (from, message) = match pending.take() {
                    Some(message) => (next.id, message),
                    None => match sub.recv_until(&clock, reply_deadline).await {
                        Ok(received) => received,
                        Err(_) => return InsertOutcome { status: Status::Timeout },
                    },
                };
                if from != next.id {
                    continue;
                }
                match message {
                    Message::InsertReply { .. } => {
                        next.reset_backoff();
                        return InsertOutcome { status: Status::Success };
                    }
                    Message::InsertFailed { reason, .. } => {
                        let status = match reason {
                            InsertRejectReason::VerifyFailure => Status::VerifyFailure,
                            InsertRejectReason::ReceiveFailed => Status::TransferFailed,
                            InsertRejectReason::Timeout => Status::Timeout,
                        };
                        return InsertOutcome { status };
                    }
                    Message::RouteNotFound { htl: new_htl, .. } => {
                        if new_htl < self.htl {
                            self.htl = new_htl;
                        }
                        skip_decrement = true;
                        break;
                    }
                    Message::SskDataFound { .. } => {
                        // Collision downstream: the stored value wins and the
                        // insert still succeeded.
                        return InsertOutcome { status: Status::Success };
                    }
                    Message::RejectedOverload { is_local: false, .. } => {
                        self.forward_overload_upstream();
                    }
                    Message::RejectedOverload { is_local: true, .. } => {
                        self.state.failure_table.on_failed(&key, &next, self.htl, "late local overload");
                        skip_decrement = true;
                        break;
                    }
                    Message::Accepted { .. } => {}
                    other => {
                        let name: &'static str = (&other).into();
                        tracing::trace!(target: "network", uid = %self.uid, message = name, "ignored during insert");
                    }
                }
            }
        }
    }

    fn request_message(&self) -> Message {
        match &self.block {
            KeyBlock::Chk(block) => Message::ChkInsertRequest {
                uid: self.uid,
                htl: self.htl,
                key: block.content_hash(),
            },
            KeyBlock::Ssk(block) => {
                let Key::Ssk { encrypted_hash, .. } = block.key() else {
                    unreachable!("ssk block has an ssk key")
                };
                Message::SskInsertRequest {
                    uid: self.uid,
                    htl: self.htl,
                    headers: block.headers().to_vec(),
                    data: block.payload().to_vec(),
                    signature: *block.signature(),
                    pubkey: self.pubkey.expect("ssk inserts carry the subspace pubkey"),
                    encrypted_hash,
                }
            }
        }
    }

    fn forward_overload_upstream(&mut self) {
        if self.forwarded_overload {
            return;
        }
        self.forwarded_overload = true;
        let Some(source) = self.source.and_then(|id| self.state.peers.get(&id)) else {
            return;
        };
        self.state.send_to_peer(
            &source,
            Message::RejectedOverload { uid: self.uid, is_local: false },
            Priority::High,
        );
    }
}

/// A fraction of successful remote fetches re-seed the network with the
/// block, from a fresh UID at full HTL.
pub(crate) fn spawn_random_reinsert(state: &Arc<NetworkState>, block: KeyBlock) {
    let state = state.clone();
    tokio::spawn(async move {
        let uid = state.random_uid();
        let kind = match &block {
            KeyBlock::Chk(_) => UidKind::ChkInsert,
            KeyBlock::Ssk(_) => UidKind::SskInsert,
        };
        let Some(lock) = state.uids.try_lock(uid, kind) else { return };
        let htl = state.config.get().htl_max;
        let mut sub = state.waiters.subscribe(uid);
        let pubkey = match &block.key() {
            Key::Ssk { pubkey_hash, .. } => match state.store.get_pubkey(pubkey_hash) {
                Some(pubkey) => Some(pubkey),
                // Without the pubkey downstream hops cannot verify; skip.
                None => return,
            },
            Key::Chk(_) => None,
        };
        let outcome = InsertSender::new(state.clone(), uid, block, pubkey, htl, None)
            .run(&mut sub)
            .await;
        tracing::debug!(target: "network", %uid, status = <&'static str>::from(outcome.status), "random reinsert finished");
        drop(lock);
    });
}
