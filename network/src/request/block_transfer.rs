//! CHK payload streaming: fixed-size packets reassembled into a
//! `PartiallyReceivedBlock`, with idempotent duplicate handling.

use crate::network_protocol::Message;
use crate::peer::PeerNode;
use crate::state::NetworkState;
use crate::transport::Priority;
use crate::waiters::Subscription;
use gyre_async::time;
use gyre_primitives::block::{PACKETS_IN_BLOCK, PACKET_SIZE};
use gyre_primitives::network::{PeerId, Uid};

#[derive(thiserror::Error, Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TransferError {
    #[error("timed out waiting for a block packet")]
    Timeout,
    #[error("malformed block packet")]
    BadPacket,
}

/// Receive-side assembly buffer for one CHK payload.
pub(crate) struct PartiallyReceivedBlock {
    packets: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl PartiallyReceivedBlock {
    pub fn new() -> PartiallyReceivedBlock {
        PartiallyReceivedBlock { packets: vec![None; PACKETS_IN_BLOCK], received: 0 }
    }

    /// Stores one packet. Duplicates are ignored; returns true once the
    /// block is complete.
    pub fn add_packet(&mut self, index: u8, data: Vec<u8>) -> Result<bool, TransferError> {
        let slot =
            self.packets.get_mut(index as usize).ok_or(TransferError::BadPacket)?;
        if data.len() != PACKET_SIZE {
            return Err(TransferError::BadPacket);
        }
        if slot.is_none() {
            *slot = Some(data);
            self.received += 1;
        }
        Ok(self.received == PACKETS_IN_BLOCK)
    }

    pub fn assemble(self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(PACKETS_IN_BLOCK * PACKET_SIZE);
        for packet in self.packets {
            payload.extend(packet.expect("assemble called on a complete block"));
        }
        payload
    }
}

/// Receives a full CHK payload from `from` over the UID's subscription.
/// Messages from other peers, and non-packet messages, are handed to
/// `on_other` (the caller may still need to forward overloads upstream
/// mid-transfer).
pub(crate) async fn receive_block(
    sub: &mut Subscription,
    clock: &time::Clock,
    from: PeerId,
    packet_timeout: time::Duration,
    mut on_other: impl FnMut(PeerId, Message),
) -> Result<Vec<u8>, TransferError> {
    let mut prb = PartiallyReceivedBlock::new();
    loop {
        let (sender, message) = sub
            .recv(clock, packet_timeout)
            .await
            .map_err(|_| TransferError::Timeout)?;
        match message {
            Message::BlockPacket { index, data, .. } if sender == from => {
                if prb.add_packet(index, data)? {
                    return Ok(prb.assemble());
                }
            }
            other => on_other(sender, other),
        }
    }
}

/// Streams a CHK payload to a peer as fixed-size packets.
pub(crate) fn send_block(state: &NetworkState, peer: &PeerNode, uid: Uid, payload: &[u8]) {
    debug_assert_eq!(payload.len(), PACKETS_IN_BLOCK * PACKET_SIZE);
    for (index, chunk) in payload.chunks(PACKET_SIZE).enumerate() {
        state.send_to_peer(
            peer,
            Message::BlockPacket { uid, index: index as u8, data: chunk.to_vec() },
            Priority::Low,
        );
    }
}
