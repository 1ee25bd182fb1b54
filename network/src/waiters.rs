use crate::network_protocol::Message;
use crate::types::WaitTimeout;
use gyre_async::time;
use gyre_primitives::network::{PeerId, Uid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-subscription buffer. Messages beyond this are dropped with a warning;
/// a correct peer never has this many in flight for one UID.
const CHANNEL_CAPACITY: usize = 64;

/// Demultiplexes uid-routed messages to the in-flight state machine waiting
/// on them. One live subscription per UID (a newer one supersedes an older,
/// e.g. when an insert handler hands the UID over to its forwarding sender);
/// delivery preserves arrival order.
#[derive(Default)]
pub(crate) struct MessageWaiters {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: HashMap<Uid, (u64, tokio::sync::mpsc::Sender<(PeerId, Message)>)>,
    next_token: u64,
}

impl MessageWaiters {
    pub fn new() -> Arc<MessageWaiters> {
        Arc::new(MessageWaiters::default())
    }

    pub fn subscribe(self: &Arc<Self>, uid: Uid) -> Subscription {
        let (tx, rx) = tokio::sync::mpsc::channel(CHANNEL_CAPACITY);
        let mut inner = self.inner.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.subscribers.insert(uid, (token, tx));
        Subscription { waiters: self.clone(), uid, token, rx }
    }

    /// Hands a message to the UID's subscriber. Returns false if nobody is
    /// listening.
    pub fn deliver(&self, uid: Uid, from: PeerId, message: Message) -> bool {
        let tx = match self.inner.lock().subscribers.get(&uid) {
            Some((_, tx)) => tx.clone(),
            None => return false,
        };
        match tx.try_send((from, message)) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target: "network", %uid, %from, ?err, "waiter queue overrun");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn unsubscribe(&self, uid: Uid, token: u64) {
        let mut inner = self.inner.lock();
        // A newer subscription for the same UID must survive the old one's
        // drop.
        if inner.subscribers.get(&uid).is_some_and(|(t, _)| *t == token) {
            inner.subscribers.remove(&uid);
        }
    }
}

/// Live subscription for one UID's messages. Dropping it unregisters.
pub(crate) struct Subscription {
    waiters: Arc<MessageWaiters>,
    uid: Uid,
    token: u64,
    rx: tokio::sync::mpsc::Receiver<(PeerId, Message)>,
}

impl Subscription {
    /// Next message for this UID, or `WaitTimeout` once `timeout` elapses.
    pub async fn recv(
        &mut self,
        clock: &time::Clock,
        timeout: time::Duration,
    ) -> Result<(PeerId, Message), WaitTimeout> {
        self.recv_until(clock, clock.now() + timeout).await
    }

    /// Next message, bounded by an absolute deadline.
    pub async fn recv_until(
        &mut self,
        clock: &time::Clock,
        deadline: time::Instant,
    ) -> Result<(PeerId, Message), WaitTimeout> {
        tokio::select! {
            received = self.rx.recv() => received.ok_or(WaitTimeout),
            _ = clock.sleep_until(deadline) => Err(WaitTimeout),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.waiters.unsubscribe(self.uid, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_async::time::FakeClock;

    #[tokio::test]
    async fn delivers_in_arrival_order() {
        let clock = FakeClock::default();
        let waiters = MessageWaiters::new();
        let mut sub = waiters.subscribe(Uid(1));
        assert!(waiters.deliver(Uid(1), PeerId(2), Message::Accepted { uid: Uid(1) }));
        assert!(waiters.deliver(Uid(1), PeerId(2), Message::DataNotFound { uid: Uid(1) }));
        let (_, first) = sub.recv(&clock.clock(), time::Duration::seconds(1)).await.unwrap();
        let (_, second) = sub.recv(&clock.clock(), time::Duration::seconds(1)).await.unwrap();
        assert!(matches!(first, Message::Accepted { .. }));
        assert!(matches!(second, Message::DataNotFound { .. }));
    }

    #[tokio::test]
    async fn undelivered_when_no_subscriber() {
        let waiters = MessageWaiters::new();
        assert!(!waiters.deliver(Uid(1), PeerId(2), Message::Void));
        let sub = waiters.subscribe(Uid(1));
        drop(sub);
        assert!(!waiters.deliver(Uid(1), PeerId(2), Message::Void));
    }

    #[tokio::test]
    async fn recv_times_out_on_fake_clock() {
        let clock = FakeClock::default();
        let waiters = MessageWaiters::new();
        let mut sub = waiters.subscribe(Uid(1));
        let clk = clock.clock();
        let waiter = tokio::spawn(async move {
            sub.recv(&clk, time::Duration::seconds(5)).await
        });
        tokio::task::yield_now().await;
        clock.advance(time::Duration::seconds(6));
        assert_eq!(waiter.await.unwrap(), Err(WaitTimeout));
    }
}
