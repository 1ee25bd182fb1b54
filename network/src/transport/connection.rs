use crate::network_protocol::{Datagram, Message, PacketHeader, MAX_DATAGRAM_SIZE};
use crate::transport::socket::DatagramSocket;
use crate::transport::{
    KeyTracker, MessageItem, Priority, SentCallback, SessionCipher, TrackerConfig, TrackerError,
};
use arc_swap::ArcSwap;
use gyre_async::time;
use gyre_primitives::network::PeerId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Smoothing factor for the peer ping average fed from transport RTT samples.
const PING_ALPHA: f64 = 0.1;

struct QueuedItem {
    item: MessageItem,
    /// Fired once the datagram carrying this item has hit the socket.
    on_wire: Option<tokio::sync::oneshot::Sender<()>>,
}

struct PingAverage {
    avg_secs: f64,
    samples: u64,
}

/// One live session with a peer: the current `KeyTracker`, the outgoing
/// message queue, and the writer task that turns both into datagrams.
///
/// The writer is the single seqno allocator; the reader task feeds
/// [`Connection::on_datagram`]. On rekey the tracker is swapped and in-flight
/// payloads are requeued with callback continuity.
pub struct Connection {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    clock: time::Clock,
    tracker: ArcSwap<KeyTracker>,
    tracker_config: TrackerConfig,
    cipher: Arc<dyn SessionCipher>,
    socket: Arc<DatagramSocket>,
    queue: Mutex<VecDeque<QueuedItem>>,
    wake: tokio::sync::Notify,
    stopped: AtomicBool,
    ping: Mutex<PingAverage>,
}

impl Connection {
    /// Creates the connection and starts its writer task.
    pub fn spawn(
        clock: time::Clock,
        peer_id: PeerId,
        addr: SocketAddr,
        socket: Arc<DatagramSocket>,
        cipher: Arc<dyn SessionCipher>,
        tracker_config: TrackerConfig,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection {
            peer_id,
            addr,
            clock: clock.clone(),
            tracker: ArcSwap::from_pointee(KeyTracker::new(clock, peer_id, tracker_config)),
            tracker_config,
            cipher,
            socket,
            queue: Mutex::new(VecDeque::new()),
            wake: tokio::sync::Notify::new(),
            stopped: AtomicBool::new(false),
            ping: Mutex::new(PingAverage { avg_secs: 0.5, samples: 0 }),
        });
        tokio::spawn(conn.clone().run_writer());
        conn
    }

    pub fn is_connected(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Queues a message for asynchronous delivery.
    pub fn enqueue(&self, item: MessageItem) {
        if !self.is_connected() {
            for cb in &item.callbacks {
                cb.disconnected();
            }
            return;
        }
        self.queue.lock().push_back(QueuedItem { item, on_wire: None });
        self.wake.notify_one();
    }

    /// Queues a message and waits until the datagram carrying it has actually
    /// been written to the socket. Routed requests use this so the acceptance
    /// deadline is measured from the wire, not from the queue.
    pub async fn send_now(&self, item: MessageItem) -> Result<(), TrackerError> {
        if !self.is_connected() {
            return Err(TrackerError::NotConnected);
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue.lock().push_back(QueuedItem { item, on_wire: Some(tx) });
        self.wake.notify_one();
        rx.await.map_err(|_| TrackerError::NotConnected)
    }

    /// Average ping fed from transport RTT measurements.
    pub fn average_ping(&self) -> time::Duration {
        time::Duration::seconds_f64(self.ping.lock().avg_secs)
    }

    pub fn tracker(&self) -> Arc<KeyTracker> {
        self.tracker.load_full()
    }

    /// Replaces the session tracker. Unacked payloads move to the successor
    /// as fresh items at the head of the queue.
    pub fn rekey(&self) {
        let fresh = Arc::new(KeyTracker::new(
            self.clock.clone(),
            self.peer_id,
            self.tracker_config,
        ));
        let old = self.tracker.swap(fresh);
        let items = old.completely_deprecated();
        let mut queue = self.queue.lock();
        for item in items.into_iter().rev() {
            queue.push_front(QueuedItem { item, on_wire: None });
        }
        drop(queue);
        tracing::debug!(target: "transport", peer = %self.peer_id, "session rekeyed");
        self.wake.notify_one();
    }

    /// Tears the session down: pending and in-flight payloads get
    /// `disconnected()` callbacks, waiters are woken.
    pub fn disconnect(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tracker.load().disconnected();
        let drained: Vec<QueuedItem> = self.queue.lock().drain(..).collect();
        for queued in &drained {
            for cb in &queued.item.callbacks {
                cb.disconnected();
            }
        }
        self.wake.notify_one();
    }

    /// Processes one inbound datagram. Returns the payload messages to
    /// dispatch, or `None` for duplicates and undecodable input.
    pub fn on_datagram(&self, bytes: Vec<u8>) -> Option<Vec<Message>> {
        let Some(plaintext) = self.cipher.open(bytes) else {
            tracing::debug!(target: "transport", peer = %self.peer_id, "undecryptable datagram");
            return None;
        };
        let datagram = match Datagram::decode(&plaintext) {
            Ok(datagram) => datagram,
            Err(err) => {
                tracing::debug!(target: "transport", peer = %self.peer_id, ?err, "malformed datagram");
                return None;
            }
        };
        let tracker = self.tracker.load_full();
        let header = &datagram.header;
        let mut acked: Vec<u32> = header.acks.clone();
        if let Some(mask) = &header.ack_bitmask {
            acked.extend(mask.seqnos());
        }
        if let Some(rtt) = tracker.on_acked_many(acked) {
            self.record_ping(rtt);
        }
        for &seqno in &header.resend_requests {
            tracker.on_resend_request(seqno);
        }
        for &seqno in &header.ack_requests {
            tracker.on_ack_request(seqno);
        }
        for &seqno in &header.forgotten {
            tracker.on_forgotten(seqno);
        }
        let deliver = match header.seqno {
            Some(seqno) => tracker.on_received_packet(seqno),
            // Bookkeeping-only datagrams carry nothing to deliver anyway.
            None => true,
        };
        // Transport deadlines may have moved; reschedule the writer.
        self.wake.notify_one();
        deliver.then_some(datagram.messages)
    }

    fn record_ping(&self, rtt: time::Duration) {
        let secs = rtt.as_seconds_f64().max(0.0);
        let mut ping = self.ping.lock();
        if ping.samples == 0 {
            ping.avg_secs = secs;
        } else {
            ping.avg_secs = ping.avg_secs * (1.0 - PING_ALPHA) + secs * PING_ALPHA;
        }
        ping.samples += 1;
    }

    async fn run_writer(self: Arc<Self>) {
        while self.is_connected() {
            let tracker = self.tracker.load_full();

            // Retransmits first: they unblock the peer's receive window.
            for (seqno, messages, _) in tracker.grab_resend_payloads() {
                self.emit(&tracker, Some(seqno), messages).await;
            }

            let mut batch: VecDeque<QueuedItem> = {
                let mut queue = self.queue.lock();
                queue.drain(..).collect()
            };
            batch.make_contiguous().sort_by_key(|queued| queued.item.priority);

            let mut alloc_error = None;
            while !batch.is_empty() {
                // Allocate before merging, so a failure leaves the batch
                // intact for requeue.
                let seqno = match tracker.allocate_outgoing_seqno().await {
                    Ok(seqno) => seqno,
                    Err(err) => {
                        alloc_error = Some(err);
                        break;
                    }
                };
                let (messages, callbacks, on_wire, priority) = take_datagram_worth(&mut batch);
                tracker.on_sent(seqno, messages.clone(), callbacks, priority);
                self.emit(&tracker, Some(seqno), messages).await;
                for tx in on_wire {
                    let _ = tx.send(());
                }
            }

            match alloc_error {
                // Rekeyed mid-batch: put everything back and retry on the
                // successor tracker.
                Some(TrackerError::KeyChanged) => {
                    let mut queue = self.queue.lock();
                    for queued in batch.into_iter().rev() {
                        queue.push_front(queued);
                    }
                    continue;
                }
                Some(_) => {
                    for queued in &batch {
                        for cb in &queued.item.callbacks {
                            cb.disconnected();
                        }
                    }
                    break;
                }
                None => {}
            }

            // Flush transport bookkeeping that came due with no payload to
            // piggyback on.
            let header = self.collect_header(&tracker, None);
            if !header.is_empty() {
                self.send_datagram(Datagram { header, messages: vec![] }).await;
            }

            // Sleep until the next transport deadline or an enqueue/receipt.
            let deadline = tracker.next_urgent_time();
            let notified = self.wake.notified();
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = self.clock.sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn collect_header(&self, tracker: &KeyTracker, seqno: Option<u32>) -> PacketHeader {
        PacketHeader {
            seqno,
            acks: tracker.grab_acks(),
            ack_bitmask: tracker.ack_bitmask(),
            resend_requests: tracker.grab_resend_requests(),
            ack_requests: tracker.grab_ack_requests(),
            forgotten: tracker.grab_forgotten(),
        }
    }

    async fn emit(&self, tracker: &KeyTracker, seqno: Option<u32>, messages: Vec<Message>) {
        let header = self.collect_header(tracker, seqno);
        self.send_datagram(Datagram { header, messages }).await;
    }

    async fn send_datagram(&self, datagram: Datagram) {
        let bytes = self.cipher.seal(datagram.encode());
        if let Err(err) = self.socket.send_to(&bytes, self.addr).await {
            // Datagram substrate errors are transient by contract; the
            // reliability layer retransmits.
            tracing::debug!(target: "transport", peer = %self.peer_id, ?err, "send failed");
        }
    }
}


/// Takes a prefix of `batch` that fits in one datagram. At least one item is
/// always taken; an oversized message therefore goes alone, never split.
fn take_datagram_worth(
    batch: &mut VecDeque<QueuedItem>,
) -> (Vec<Message>, Vec<Arc<dyn SentCallback>>, Vec<tokio::sync::oneshot::Sender<()>>, Priority) {
    let mut messages = Vec::new();
    let mut callbacks = Vec::new();
    let mut on_wire = Vec::new();
    let mut priority = Priority::Low;
    let mut size = 64; // header allowance
    while let Some(queued) = batch.front() {
        let item_size: usize = queued
            .item
            .messages
            .iter()
            .map(|msg| borsh::object_length(msg).unwrap_or(MAX_DATAGRAM_SIZE))
            .sum();
        if !messages.is_empty() && size + item_size > MAX_DATAGRAM_SIZE {
            break;
        }
        size += item_size;
        let queued = batch.pop_front().unwrap();
        priority = priority.min(queued.item.priority);
        messages.extend(queued.item.messages);
        callbacks.extend(queued.item.callbacks);
        if let Some(tx) = queued.on_wire {
            on_wire.push(tx);
        }
    }
    (messages, callbacks, on_wire, priority)
}
