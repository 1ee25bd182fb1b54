//! The per-request state machine: offered-key sweep, HTL-routed greedy
//! forwarding with backtracking, block transfer and SSK finalization.

use crate::network_protocol::{Key, Message};
use crate::peer::selector;
use crate::request::block_transfer::{self, TransferError};
use crate::request::insert;
use crate::state::NetworkState;
use crate::transport::Priority;
use crate::types::{RequestOutcome, Status};
use crate::waiters::Subscription;
use gyre_async::time;
use gyre_primitives::block::{ChkBlock, KeyBlock, SskBlock, SubspacePublicKey};
use gyre_primitives::network::{PeerId, Uid};
use gyre_store::block_store::{PutOutcome, StoreTier};
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome of a completed block transfer within the sender.
enum Flow {
    Done(RequestOutcome),
    /// Transfer aborted mid-route; try the next candidate within HTL.
    ContinueRouting,
}

pub(crate) struct RequestSender {
    state: Arc<NetworkState>,
    uid: Uid,
    key: Key,
    htl: u8,
    /// Upstream peer, `None` for locally originated requests.
    source: Option<PeerId>,
    /// Exhaust the offered-key fast path and stop (ULPR-style probes).
    try_offers_only: bool,
    visited: HashSet<PeerId>,
    pub_key: Option<SubspacePublicKey>,
    /// SSK data received while the pubkey is still on its way.
    ssk_found: Option<(Vec<u8>, Vec<u8>, [u8; 64])>,
    has_forwarded: bool,
    last_next: Option<PeerId>,
    forwarded_overload: bool,
    data_source: Option<PeerId>,
}

impl RequestSender {
    pub fn new(
        state: Arc<NetworkState>,
        uid: Uid,
        key: Key,
        htl: u8,
        source: Option<PeerId>,
        try_offers_only: bool,
    ) -> RequestSender {
        RequestSender {
            state,
            uid,
            key,
            htl,
            source,
            try_offers_only,
            visited: HashSet::new(),
            pub_key: None,
            ssk_found: None,
            has_forwarded: false,
            last_next: None,
            forwarded_overload: false,
            data_source: None,
        }
    }

    /// Drives the request to exactly one terminal status. The overall
    /// deadline is a liveness guard against missed state transitions; hitting
    /// it is a bug and reports `InternalError`.
    pub async fn run(mut self) -> RequestOutcome {
        let clock = self.state.clock.clone();
        let deadline = self.state.config.get().overall_deadline();
        let uid = self.uid;
        let initial_htl = self.htl;
        let inner = self.run_inner();
        tokio::pin!(inner);
        tokio::select! {
            outcome = &mut inner => {
                tracing::debug!(target: "network", %uid, status = <&'static str>::from(outcome.status), "request finished");
                outcome
            }
            _ = clock.sleep(deadline) => {
                tracing::error!(target: "network", %uid, "request missed its overall deadline");
                RequestOutcome::failed(Status::InternalError, initial_htl)
            }
        }
    }

    async fn run_inner(&mut self) -> RequestOutcome {
        let mut sub = self.state.waiters.subscribe(self.uid);
        if let Key::Ssk { pubkey_hash, .. } = self.key {
            self.pub_key = self.state.store.get_pubkey(&pubkey_hash);
        }
        if let Some(outcome) = self.sweep_offers(&mut sub).await {
            return outcome;
        }
        if self.try_offers_only {
            let reject_time = self.state.config.get().reject_time();
            self.state.failure_table.on_final_failure(
                self.key,
                None,
                self.htl,
                reject_time,
                self.source,
            );
            return self.finish(Status::DataNotFound);
        }
        self.routing_loop(&mut sub).await
    }

    fn finish(&self, status: Status) -> RequestOutcome {
        RequestOutcome {
            status,
            block: None,
            pubkey: self.pub_key,
            time_left: None,
            final_htl: self.htl,
            data_source: self.data_source,
        }
    }

    fn finish_success(&self, block: KeyBlock) -> RequestOutcome {
        RequestOutcome {
            status: Status::Success,
            block: Some(block),
            pubkey: self.pub_key,
            time_left: None,
            final_htl: self.htl,
            data_source: self.data_source,
        }
    }

    // ---- Phase A: offered-key sweep -------------------------------------

    /// Probes peers that have offered this key before any routing happens.
    /// Returns `Some` iff the sweep terminated the request.
    async fn sweep_offers(&mut self, sub: &mut Subscription) -> Option<RequestOutcome> {
        let clock = self.state.clock.clone();
        let mut offers = self.state.failure_table.get_offers(&self.key);
        while let Some(offer) = offers.next() {
            let Some(peer) = self.state.peers.get(&offer.peer) else {
                offers.delete_last_offer();
                continue;
            };
            // A restarted offerer has lost its cache; the offer is dead.
            if !peer.is_connected() || peer.boot_id() != offer.boot_id {
                offers.delete_last_offer();
                continue;
            }
            let need_pubkey = self.key.is_ssk() && self.pub_key.is_none();
            let request = Message::GetOfferedKey {
                uid: self.uid,
                key: self.key,
                authenticator: offer.authenticator,
                need_pubkey,
            };
            if !self.state.send_to_peer(&peer, request, Priority::High) {
                offers.delete_last_offer();
                continue;
            }
            let deadline = clock.now() + self.state.config.get().get_offer_timeout();
            loop {
                let Ok((from, message)) = sub.recv_until(&clock, deadline).await else {
                    offers.delete_last_offer();
                    break;
                };
                if from != offer.peer {
                    tracing::trace!(target: "network", uid = %self.uid, %from, "stray message during offer sweep");
                    continue;
                }
                match message {
                    Message::RejectedOverload { .. } => {
                        // Transient on their side; the offer may still be
                        // good for the next request.
                        offers.keep_last_offer();
                        break;
                    }
                    Message::GetOfferedKeyInvalid { reason, .. } => {
                        tracing::debug!(target: "network", uid = %self.uid, peer = %from, reason = <&'static str>::from(reason), "offer invalid");
                        offers.delete_last_offer();
                        break;
                    }
                    Message::SskPubKey { pubkey, .. } => {
                        let Key::Ssk { pubkey_hash, .. } = self.key else { continue };
                        if self.state.learn_pubkey(&pubkey_hash, pubkey) {
                            self.pub_key = Some(pubkey);
                        } else {
                            offers.delete_last_offer();
                            break;
                        }
                    }
                    Message::ChkDataFound { headers, .. } => {
                        match self.receive_chk(sub, from, headers, true).await {
                            Flow::Done(outcome) => return Some(outcome),
                            Flow::ContinueRouting => unreachable!("offer transfers are terminal"),
                        }
                    }
                    Message::SskDataFound { headers, data, signature, .. } => {
                        self.ssk_found = Some((headers, data, signature));
                        if self.pub_key.is_some() {
                            return Some(self.finalize_ssk(from, true));
                        }
                        // Wait for the pubkey within the same deadline.
                    }
                    other => {
                        let name: &'static str = (&other).into();
                        tracing::trace!(target: "network", uid = %self.uid, message = name, "ignored during offer sweep");
                    }
                }
            }
        }
        None
    }

    // ---- Phase B: the routing loop --------------------------------------

    async fn routing_loop(&mut self, sub: &mut Subscription) -> RequestOutcome {
        let clock = self.state.clock.clone();
        let target = self.key.location();
        // Set when a downstream reply already moved us to the
        // next-candidate step, so HTL must not decrement again.
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
                // DataNotFound, never RouteNotFound: an HTL-exhausted reply
                // must not reveal how long the chain was.
                self.state.failure_table.on_final_failure(
                    self.key,
                    None,
                    self.htl,
                    config.reject_time(),
                    self.source,
                );
                return self.finish(Status::DataNotFound);
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
                self.state.failure_table.on_final_failure(
                    self.key,
                    None,
                    self.htl,
                    config.reject_time(),
                    self.source,
                );
                return self.finish(Status::RouteNotFound);
            };
            self.visited.insert(next.id);

            // Synchronous send: the acceptance deadline must start from the
            // wire, not from a queue behind other traffic to this peer.
            let request = self.request_message();
            if self.state.send_to_peer_now(&next, request, Priority::High).await.is_err() {
                self.state.failure_table.on_failed(&self.key, &next, self.htl, "send failed");
                continue;
            }
            self.has_forwarded = true;
            self.last_next = Some(next.id);
            let sent_time = clock.now();

            // Step 5: wait for acceptance.
            let mut pending = None;
            let accept_deadline = clock.now() + config.accepted_timeout();
            let accepted = loop {
                let Ok((from, message)) = sub.recv_until(&clock, accept_deadline).await else {
                    self.state.failure_table.on_failed(
                        &self.key,
                        &next,
                        self.htl,
                        "accept timeout",
                    );
                    break false;
                };
                if from != next.id {
                    continue;
                }
                match message {
                    Message::Accepted { .. } => break true,
                    Message::RejectedLoop { .. } => {
                        self.state.failure_table.on_failed(
                            &self.key,
                            &next,
                            self.htl,
                            "rejected loop",
                        );
                        break false;
                    }
                    Message::RejectedOverload { is_local: true, .. } => {
                        self.state.failure_table.on_failed(
                            &self.key,
                            &next,
                            self.htl,
                            "local overload",
                        );
                        break false;
                    }
                    Message::RejectedOverload { is_local: false, .. } => {
                        // Non-fatal: forward upstream, keep waiting on the
                        // same peer.
                        self.forward_overload_upstream();
                    }
                    // The hop can short-circuit straight to a terminal reply.
                    other => {
                        pending = Some(other);
                        break true;
                    }
                }
            };
            if !accepted {
                continue;
            }

            // Step 6: wait for the terminal set.
            let fetch_deadline = clock.now() + config.fetch_timeout();
            loop {
                let (from, message) = match pending.take() {
                    Some(message) => (next.id, message),
                    None => match sub.recv_until(&clock, fetch_deadline).await {
                        Ok(received) => received,
                        Err(_) => {
                            self.state.failure_table.on_final_failure(
                                self.key,
                                Some(next.id),
                                self.htl,
                                config.reject_time(),
                                self.source,
                            );
                            return self.finish(Status::Timeout);
                        }
                    },
                };
                if from != next.id {
                    continue;
                }
                match message {
                    Message::DataNotFound { .. } => {
                        self.state.failure_table.on_final_failure(
                            self.key,
                            Some(next.id),
                            self.htl,
                            config.reject_time(),
                            self.source,
                        );
                        return self.finish(Status::DataNotFound);
                    }
                    Message::RecentlyFailed { time_left_ms, .. } => {
                        let received = time::Duration::milliseconds(time_left_ms as i64);
                        let elapsed = clock.now() - sent_time;
                        // Charge the round trip plus a 1% haircut, and never
                        // report more than we were told: a loop of refreshes
                        // must decay, not persist.
                        let adjusted = ((received - elapsed).max(time::Duration::ZERO)
                            - received / 100i32)
                            .max(time::Duration::ZERO)
                            .min(received);
                        self.state.failure_table.on_final_failure(
                            self.key,
                            Some(next.id),
                            self.htl,
                            adjusted,
                            self.source,
                        );
                        let mut outcome = self.finish(Status::RecentlyFailed);
                        outcome.time_left = Some(adjusted);
                        return outcome;
                    }
                    Message::RouteNotFound { htl: new_htl, .. } => {
                        // Downstream ran out of candidates; take over with
                        // its (possibly lower) HTL and keep our visited set.
                        if new_htl < self.htl {
                            self.htl = new_htl;
                        }
                        skip_decrement = true;
                        break;
                    }
                    Message::RejectedOverload { is_local: false, .. } => {
                        self.forward_overload_upstream();
                    }
                    Message::RejectedOverload { is_local: true, .. } => {
                        self.state.failure_table.on_failed(
                            &self.key,
                            &next,
                            self.htl,
                            "late local overload",
                        );
                        skip_decrement = true;
                        break;
                    }
                    Message::ChkDataFound { headers, .. } => {
                        match self.receive_chk(sub, from, headers, false).await {
                            Flow::Done(outcome) => return outcome,
                            Flow::ContinueRouting => {
                                self.state.failure_table.on_failed(
                                    &self.key,
                                    &next,
                                    self.htl,
                                    "transfer failed",
                                );
                                skip_decrement = true;
                                break;
                            }
                        }
                    }
                    Message::SskDataFound { headers, data, signature, .. } => {
                        self.ssk_found = Some((headers, data, signature));
                        if self.pub_key.is_some() {
                            return self.finalize_ssk(from, false);
                        }
                    }
                    Message::SskPubKey { pubkey, .. } => {
                        let Key::Ssk { pubkey_hash, .. } = self.key else { continue };
                        if !self.state.learn_pubkey(&pubkey_hash, pubkey) {
                            return self.finish(Status::VerifyFailure);
                        }
                        self.pub_key = Some(pubkey);
                        if self.ssk_found.is_some() {
                            return self.finalize_ssk(from, false);
                        }
                    }
                    Message::Accepted { .. } => {}
                    other => {
                        let name: &'static str = (&other).into();
                        tracing::trace!(target: "network", uid = %self.uid, message = name, "ignored during fetch");
                    }
                }
            }
        }
    }

    fn request_message(&self) -> Message {
        match self.key {
            Key::Chk(key) => Message::ChkDataRequest { uid: self.uid, htl: self.htl, key },
            Key::Ssk { pubkey_hash, encrypted_hash } => Message::SskDataRequest {
                uid: self.uid,
                htl: self.htl,
                pubkey_hash,
                encrypted_hash,
                need_pubkey: self.pub_key.is_none(),
            },
        }
    }

    /// Forwards a remote overload to the upstream source, once. Repeats are
    /// absorbed; the signal never reflects back toward where it came from.
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

    // ---- Phase T: CHK block transfer ------------------------------------

    async fn receive_chk(
        &mut self,
        sub: &mut Subscription,
        from: PeerId,
        headers: Vec<u8>,
        from_offer: bool,
    ) -> Flow {
        let clock = self.state.clock.clone();
        let config = self.state.config.get();
        // Only one transfer per key at a time; a racing request waits for the
        // winner and then reads the store.
        match self.state.transfers.try_begin(self.key) {
            Ok(_claim) => {}
            Err(existing) => {
                existing.notified().await;
                if let Some(block) = self.state.store.get(&self.key) {
                    self.data_source = Some(from);
                    return Flow::Done(self.finish_success(block));
                }
                let status = if from_offer {
                    Status::GetOfferTransferFailed
                } else {
                    Status::TransferFailed
                };
                return Flow::Done(self.finish(status));
            }
        }
        let uid = self.uid;
        let received = block_transfer::receive_block(
            sub,
            &clock,
            from,
            config.block_transfer_packet_timeout(),
            |sender, message| {
                let name: &'static str = (&message).into();
                tracing::trace!(target: "network", %uid, %sender, message = name, "ignored during transfer");
            },
        )
        .await;
        self.state.transfers.finish(&self.key);
        match received {
            Ok(payload) => {
                let block = match ChkBlock::new(headers, payload) {
                    Ok(block) => block,
                    Err(_) => return Flow::Done(self.verify_failure(from_offer)),
                };
                if block.verify(&self.key).is_err() {
                    return Flow::Done(self.verify_failure(from_offer));
                }
                self.data_source = Some(from);
                if let Some(peer) = self.state.peers.get(&from) {
                    peer.reset_backoff();
                }
                let block = KeyBlock::Chk(block);
                self.state.commit_block(block.clone(), StoreTier::Shallow);
                if self.state.roll_random_reinsert() {
                    insert::spawn_random_reinsert(&self.state, block.clone());
                }
                Flow::Done(self.finish_success(block))
            }
            Err(TransferError::Timeout) | Err(TransferError::BadPacket) => {
                if from_offer {
                    Flow::Done(self.finish(Status::GetOfferTransferFailed))
                } else {
                    Flow::ContinueRouting
                }
            }
        }
    }

    fn verify_failure(&self, from_offer: bool) -> RequestOutcome {
        // The peer is not banned for this; the offer, if any, dies with the
        // request status.
        let status =
            if from_offer { Status::GetOfferVerifyFailure } else { Status::VerifyFailure };
        self.finish(status)
    }

    // ---- Phase F: SSK finalize ------------------------------------------

    fn finalize_ssk(&mut self, from: PeerId, from_offer: bool) -> RequestOutcome {
        let Some((headers, data, signature)) = self.ssk_found.take() else {
            return self.finish(Status::InternalError);
        };
        let Some(pubkey) = self.pub_key else {
            return self.finish(Status::InternalError);
        };
        let Key::Ssk { pubkey_hash, encrypted_hash } = self.key else {
            return self.finish(Status::InternalError);
        };
        let block = match SskBlock::new(pubkey_hash, encrypted_hash, headers, data, signature) {
            Ok(block) => block,
            Err(_) => return self.verify_failure(from_offer),
        };
        if block.verify(&self.key, &pubkey).is_err() {
            return self.verify_failure(from_offer);
        }
        self.data_source = Some(from);
        if let Some(peer) = self.state.peers.get(&from) {
            peer.reset_backoff();
        }
        let block = KeyBlock::Ssk(block);
        match self.state.commit_block(block.clone(), StoreTier::Shallow) {
            // Someone beat us to the slot: the stored value wins and the
            // request still succeeds.
            PutOutcome::Collision(stored) => self.finish_success(stored),
            _ => self.finish_success(block),
        }
    }
}
