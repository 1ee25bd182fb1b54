//! Per-peer reliable transport over unreliable datagrams.
//!
//! Each connected peer has a session `KeyTracker` doing seqno allocation,
//! ack/resend bookkeeping and retransmit policy, and a writer task
//! (`connection`) that coalesces pending messages plus due transport items
//! into datagrams.

pub mod connection;
pub mod fabric;
mod key_tracker;
mod packet_queue;
pub mod socket;

pub use key_tracker::{KeyTracker, TrackerConfig, RECEIVED_WINDOW, SENT_WINDOW};

use crate::network_protocol::Message;
use gyre_async::time;
use std::sync::Arc;

/// Relative order in which queued messages are drained into datagrams.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Completion callbacks for a sent message. Called under no locks; must be
/// cheap and non-blocking (dispatch slow work to a task).
pub trait SentCallback: Send + Sync {
    fn acknowledged(&self, _rtt: time::Duration) {}
    fn disconnected(&self) {}
}

/// A message queued for (re)transmission, with its delivery callbacks.
pub struct MessageItem {
    pub messages: Vec<Message>,
    pub priority: Priority,
    pub callbacks: Vec<Arc<dyn SentCallback>>,
}

impl MessageItem {
    pub fn new(message: Message, priority: Priority) -> Self {
        MessageItem { messages: vec![message], priority, callbacks: Vec::new() }
    }

    pub fn with_callback(mut self, cb: Arc<dyn SentCallback>) -> Self {
        self.callbacks.push(cb);
        self
    }
}

#[derive(thiserror::Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum TrackerError {
    /// The session has been rekeyed; retry on the successor tracker.
    #[error("session key changed")]
    KeyChanged,
    /// The peer's session is gone; treat as a skipable transient.
    #[error("peer not connected")]
    NotConnected,
    /// The send window is full (try_ variant only).
    #[error("send window full")]
    WouldBlock,
}

/// Seam for the session cipher. Datagram bytes pass through here on both
/// sides; the real implementation is negotiated per session, tests use the
/// identity.
pub trait SessionCipher: Send + Sync {
    fn seal(&self, plaintext: Vec<u8>) -> Vec<u8>;
    fn open(&self, ciphertext: Vec<u8>) -> Option<Vec<u8>>;
}

/// No-op cipher for tests and until session negotiation lands.
pub struct PlainCipher;

impl SessionCipher for PlainCipher {
    fn seal(&self, plaintext: Vec<u8>) -> Vec<u8> {
        plaintext
    }
    fn open(&self, ciphertext: Vec<u8>) -> Option<Vec<u8>> {
        Some(ciphertext)
    }
}
