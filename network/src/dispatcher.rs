//! Inbound message classification: trivial messages are handled inline,
//! request/insert messages run the loop/overload admission gauntlet and spawn
//! a handler task, everything else is demultiplexed by UID to the in-flight
//! state machine waiting on it.

use crate::network_protocol::{Key, Message, OfferRejectReason};
use crate::peer::PeerNode;
use crate::request::{handler, insert};
use crate::state::NetworkState;
use crate::transport::Priority;
use crate::uid_registry::UidKind;
use gyre_async::time;
use gyre_primitives::hash::CryptoHash;
use gyre_primitives::network::Uid;
use std::sync::Arc;

impl NetworkState {
    pub fn handle_message(self: &Arc<Self>, from: Arc<PeerNode>, message: Message) {
        let name: &'static str = (&message).into();
        tracing::trace!(target: "network", peer = %from.id, message = name, "inbound");
        match message {
            Message::Ping { nonce } => {
                self.send_to_peer(&from, Message::Pong { nonce }, Priority::High);
            }
            Message::Pong { .. } | Message::Void => {}
            Message::Disconnect => {
                from.set_disconnected();
            }
            Message::LocationChanged { location } => {
                from.set_location(location);
            }
            Message::OfferKey { key, authenticator, expiry_ms } => {
                self.failure_table.on_offer_received(
                    from.id,
                    key,
                    authenticator,
                    from.boot_id(),
                    time::Duration::milliseconds(expiry_ms as i64),
                );
            }
            Message::ChkDataRequest { uid, htl, key } => {
                self.on_incoming_request(from, uid, htl, Key::Chk(key), false, UidKind::ChkRequest);
            }
            Message::SskDataRequest { uid, htl, pubkey_hash, encrypted_hash, need_pubkey } => {
                let key = Key::Ssk { pubkey_hash, encrypted_hash };
                self.on_incoming_request(from, uid, htl, key, need_pubkey, UidKind::SskRequest);
            }
            Message::ChkInsertRequest { uid, htl, key } => {
                self.on_incoming_insert(from, uid, htl, insert::IncomingInsert::Chk { key });
            }
            Message::SskInsertRequest {
                uid,
                htl,
                headers,
                data,
                signature,
                pubkey,
                encrypted_hash,
            } => {
                let body =
                    insert::IncomingInsert::Ssk { headers, data, signature, pubkey, encrypted_hash };
                self.on_incoming_insert(from, uid, htl, body);
            }
            Message::GetOfferedKey { uid, key, authenticator, need_pubkey } => {
                self.on_get_offered_key(from, uid, key, authenticator, need_pubkey);
            }
            Message::OpennetNoderef { uid, noderef } => {
                // If the request is still alive locally, its owner decides;
                // otherwise the opennet policy does.
                let message = Message::OpennetNoderef { uid, noderef: noderef.clone() };
                if !self.waiters.deliver(uid, from.id, message) {
                    let decision = self.opennet.on_noderef_offered(uid, from.id, &noderef);
                    tracing::debug!(target: "network", %uid, peer = %from.id, ?decision, "noderef offered");
                }
            }
            other => {
                let uid = other.uid().expect("non-uid messages are handled above");
                if !self.waiters.deliver(uid, from.id, other) {
                    tracing::trace!(target: "network", peer = %from.id, %uid, "message for no in-flight request");
                }
                self.stats.set_unclaimed_fifo(self.waiters.len());
            }
        }
    }

    /// Admission path for an incoming data request: loop rejection first
    /// (cheap, must answer fast), then the UID lock, then load shedding.
    fn on_incoming_request(
        self: &Arc<Self>,
        from: Arc<PeerNode>,
        uid: Uid,
        htl: u8,
        key: Key,
        need_pubkey: bool,
        kind: UidKind,
    ) {
        if self.uids.recently_completed(uid) {
            self.send_to_peer(&from, Message::RejectedLoop { uid }, Priority::High);
            return;
        }
        let Some(lock) = self.uids.try_lock(uid, kind) else {
            self.send_to_peer(&from, Message::RejectedLoop { uid }, Priority::High);
            return;
        };
        let is_ssk = key.is_ssk();
        if self.stats.should_reject_request(false, is_ssk).is_some() {
            self.send_to_peer(
                &from,
                Message::RejectedOverload { uid, is_local: true },
                Priority::High,
            );
            lock.release_non_terminal();
            return;
        }
        self.send_to_peer(&from, Message::Accepted { uid }, Priority::High);
        let state = self.clone();
        tokio::spawn(async move {
            handler::run(state, from, lock, key, htl, need_pubkey).await;
        });
    }

    fn on_incoming_insert(
        self: &Arc<Self>,
        from: Arc<PeerNode>,
        uid: Uid,
        htl: u8,
        body: insert::IncomingInsert,
    ) {
        if self.uids.recently_completed(uid) {
            self.send_to_peer(&from, Message::RejectedLoop { uid }, Priority::High);
            return;
        }
        let kind = match &body {
            insert::IncomingInsert::Chk { .. } => UidKind::ChkInsert,
            insert::IncomingInsert::Ssk { .. } => UidKind::SskInsert,
        };
        let Some(lock) = self.uids.try_lock(uid, kind) else {
            self.send_to_peer(&from, Message::RejectedLoop { uid }, Priority::High);
            return;
        };
        let is_ssk = matches!(body, insert::IncomingInsert::Ssk { .. });
        if self.stats.should_reject_request(true, is_ssk).is_some() {
            self.send_to_peer(
                &from,
                Message::RejectedOverload { uid, is_local: true },
                Priority::High,
            );
            lock.release_non_terminal();
            return;
        }
        // Subscribe before acknowledging: the inserter streams the block the
        // moment it sees `Accepted`.
        let sub = self.waiters.subscribe(uid);
        self.send_to_peer(&from, Message::Accepted { uid }, Priority::High);
        let state = self.clone();
        tokio::spawn(async move {
            insert::run_handler(state, from, lock, htl, body, sub).await;
        });
    }

    /// Serves a `GetOfferedKey`: the authenticator must be one we minted this
    /// boot, and the block must still be present.
    fn on_get_offered_key(
        self: &Arc<Self>,
        from: Arc<PeerNode>,
        uid: Uid,
        key: Key,
        authenticator: [u8; 32],
        need_pubkey: bool,
    ) {
        if !self.verify_offer_authenticator(&key, &authenticator) {
            self.send_to_peer(
                &from,
                Message::GetOfferedKeyInvalid { uid, reason: OfferRejectReason::BadAuthenticator },
                Priority::High,
            );
            return;
        }
        let Some(lock) = self.uids.try_lock(uid, UidKind::OfferedKey) else {
            self.send_to_peer(&from, Message::RejectedLoop { uid }, Priority::High);
            return;
        };
        let Some(block) = self.store.get(&key) else {
            self.send_to_peer(
                &from,
                Message::GetOfferedKeyInvalid { uid, reason: OfferRejectReason::NoSuchKey },
                Priority::High,
            );
            lock.release_non_terminal();
            return;
        };
        handler::serve_block(self, &from, uid, block, need_pubkey);
        drop(lock);
    }

    /// Locally learned pubkeys ride on the request path; remember them.
    pub(crate) fn learn_pubkey(
        &self,
        expected_hash: &CryptoHash,
        pubkey: gyre_primitives::block::SubspacePublicKey,
    ) -> bool {
        if pubkey.hash() != *expected_hash {
            return false;
        }
        self.store.put_pubkey(pubkey);
        true
    }
}
