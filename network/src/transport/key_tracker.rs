use crate::network_protocol::{AckBitmask, Message};
use crate::transport::packet_queue::PacketQueue;
use crate::transport::{MessageItem, Priority, SentCallback, TrackerError};
use gyre_async::time;
use gyre_primitives::network::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// At most this many outgoing datagrams may be unacked; allocation blocks
/// beyond it.
pub const SENT_WINDOW: usize = 128;
/// Sliding window of remembered incoming seqnos. Anything older counts as
/// already seen.
pub const RECEIVED_WINDOW: u32 = 512;

/// An ack should go out well before the peer's ack-request fires.
const ACK_URGENCY: time::Duration = time::Duration::milliseconds(200);
/// After emitting a resend request, wait this long before asking again.
const RESEND_REQUEST_BACKOFF: time::Duration = time::Duration::milliseconds(500);
/// Ack-request initial delay clamp.
const MIN_ACK_REQUEST_DELAY: time::Duration = time::Duration::milliseconds(250);
const MAX_ACK_REQUEST_DELAY: time::Duration = time::Duration::milliseconds(2500);
/// RTT estimate before the first sample.
const INITIAL_RTT: time::Duration = time::Duration::milliseconds(500);
/// EWMA smoothing factor for the RTT estimate.
const RTT_ALPHA: f64 = 0.125;

/// Tunables that come from the network config.
#[derive(Clone, Copy, Debug)]
pub struct TrackerConfig {
    /// Urgency of a gap-driven resend request.
    pub max_coalescing_delay: time::Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig { max_coalescing_delay: time::Duration::milliseconds(100) }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Status {
    Active,
    Deprecated,
    Disconnected,
}

struct SentPacket {
    messages: Vec<Message>,
    send_time: time::Instant,
    last_sent: time::Instant,
    /// Peer asked for a retransmit.
    resend_asap: bool,
    /// Retransmitted at least once; its ack no longer yields an RTT sample.
    resent: bool,
    callbacks: Vec<Arc<dyn SentCallback>>,
    priority: Priority,
}

/// Bitmap over the `RECEIVED_WINDOW` seqnos at and below the highest seen.
struct ReceivedWindow {
    highest: Option<u32>,
    // bit k of the window = seqno `highest - k`.
    bits: [u64; (RECEIVED_WINDOW / 64) as usize],
}

impl ReceivedWindow {
    fn new() -> Self {
        ReceivedWindow { highest: None, bits: [0; (RECEIVED_WINDOW / 64) as usize] }
    }

    fn contains(&self, seqno: u32) -> bool {
        let Some(highest) = self.highest else { return false };
        if seqno_newer(seqno, highest) {
            return false;
        }
        let age = highest.wrapping_sub(seqno);
        if age >= RECEIVED_WINDOW {
            // Fell off the window; report as seen so stale duplicates stay
            // idempotent.
            return true;
        }
        self.bits[(age / 64) as usize] & (1 << (age % 64)) != 0
    }

    /// Marks a seqno received. Returns true iff it was not seen before.
    fn mark(&mut self, seqno: u32) -> bool {
        match self.highest {
            None => {
                self.highest = Some(seqno);
                self.bits = Default::default();
                self.bits[0] |= 1;
                true
            }
            Some(highest) if seqno_newer(seqno, highest) => {
                self.shift(seqno.wrapping_sub(highest));
                self.highest = Some(seqno);
                self.bits[0] |= 1;
                true
            }
            Some(_) => {
                if self.contains(seqno) {
                    return false;
                }
                let age = self.highest.unwrap().wrapping_sub(seqno);
                self.bits[(age / 64) as usize] |= 1 << (age % 64);
                true
            }
        }
    }

    /// Shifts the window up by `delta` new seqnos (older entries age out).
    fn shift(&mut self, delta: u32) {
        if delta >= RECEIVED_WINDOW {
            self.bits = Default::default();
            return;
        }
        let words = self.bits.len();
        let word_shift = (delta / 64) as usize;
        let bit_shift = delta % 64;
        let mut next = [0u64; (RECEIVED_WINDOW / 64) as usize];
        for i in (0..words).rev() {
            let src = i.checked_sub(word_shift);
            let Some(src) = src else { continue };
            next[i] |= self.bits[src] << bit_shift;
            if bit_shift > 0 && src >= 1 {
                next[i] |= self.bits[src - 1] >> (64 - bit_shift);
            }
        }
        self.bits = next;
    }

    /// Ack bitmask over the 32 seqnos below `highest + 1`, for piggybacking
    /// in every outgoing header.
    fn ack_bitmask(&self) -> Option<AckBitmask> {
        let highest = self.highest?;
        let mut bits = 0u32;
        for i in 0..32u32 {
            if self.contains(highest.wrapping_sub(i)) {
                bits |= 1 << i;
            }
        }
        Some(AckBitmask { base: highest.wrapping_add(1), bits })
    }
}

/// `a` is strictly newer than `b` under wrapping arithmetic.
fn seqno_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

struct Inner {
    status: Status,
    next_seqno: u32,
    sent: HashMap<u32, SentPacket>,
    received: ReceivedWindow,
    /// Acks we owe the peer.
    acks: PacketQueue,
    /// Seqnos we saw gaps below and want retransmitted.
    resend_requests: PacketQueue,
    /// Our own sent seqnos we want acked.
    ack_requests: PacketQueue,
    /// Seqnos the peer asked about that we no longer have.
    forgotten: Vec<u32>,
    /// Smoothed RTT, seconds.
    srtt: f64,
    has_rtt_sample: bool,
}

impl Inner {
    fn rtt(&self) -> time::Duration {
        time::Duration::seconds_f64(self.srtt)
    }

    fn report_rtt(&mut self, sample: time::Duration) {
        let secs = sample.as_seconds_f64().max(0.0);
        if self.has_rtt_sample {
            self.srtt = self.srtt * (1.0 - RTT_ALPHA) + secs * RTT_ALPHA;
        } else {
            self.srtt = secs;
            self.has_rtt_sample = true;
        }
    }

    fn ack_request_delay(&self) -> time::Duration {
        (self.rtt() * 2i32).clamp(MIN_ACK_REQUEST_DELAY, MAX_ACK_REQUEST_DELAY)
    }
}

/// Reliable-delivery state for one direction pair of a single session.
///
/// Created on session key negotiation; replaced on rekey (the successor
/// inherits in-flight payloads via [`KeyTracker::completely_deprecated`]).
/// Accessed from the connection's writer task (allocation, grabs) and the
/// reader task (receipt, acks); all state sits behind one mutex which is
/// never held across I/O.
pub struct KeyTracker {
    clock: time::Clock,
    peer: PeerId,
    config: TrackerConfig,
    inner: Mutex<Inner>,
    /// Signalled on window space and on status changes.
    space: tokio::sync::Notify,
}

impl KeyTracker {
    pub fn new(clock: time::Clock, peer: PeerId, config: TrackerConfig) -> Self {
        KeyTracker {
            clock,
            peer,
            config,
            inner: Mutex::new(Inner {
                status: Status::Active,
                next_seqno: 0,
                sent: HashMap::new(),
                received: ReceivedWindow::new(),
                acks: PacketQueue::new(),
                resend_requests: PacketQueue::new(),
                ack_requests: PacketQueue::new(),
                forgotten: Vec::new(),
                srtt: INITIAL_RTT.as_seconds_f64(),
                has_rtt_sample: false,
            }),
            space: tokio::sync::Notify::new(),
        }
    }

    /// Next outgoing seqno, waiting for send-window space. The caller must
    /// follow up with [`KeyTracker::on_sent`] before allocating again (the
    /// writer task is the single allocator).
    pub async fn allocate_outgoing_seqno(&self) -> Result<u32, TrackerError> {
        loop {
            match self.try_allocate_outgoing_seqno() {
                Err(TrackerError::WouldBlock) => {}
                other => return other,
            }
            let notified = self.space.notified();
            tokio::pin!(notified);
            // Register before re-checking, so a wakeup between the check and
            // the await is not lost.
            notified.as_mut().enable();
            match self.try_allocate_outgoing_seqno() {
                Err(TrackerError::WouldBlock) => notified.await,
                other => return other,
            }
        }
    }

    pub fn try_allocate_outgoing_seqno(&self) -> Result<u32, TrackerError> {
        let mut inner = self.inner.lock();
        match inner.status {
            Status::Deprecated => return Err(TrackerError::KeyChanged),
            Status::Disconnected => return Err(TrackerError::NotConnected),
            Status::Active => {}
        }
        if inner.sent.len() >= SENT_WINDOW {
            return Err(TrackerError::WouldBlock);
        }
        let seqno = inner.next_seqno;
        inner.next_seqno = inner.next_seqno.wrapping_add(1);
        Ok(seqno)
    }

    /// Records a transmitted payload and schedules an ack-request that goes
    /// active after ~2·RTT.
    pub fn on_sent(
        &self,
        seqno: u32,
        messages: Vec<Message>,
        callbacks: Vec<Arc<dyn SentCallback>>,
        priority: Priority,
    ) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let delay = inner.ack_request_delay();
        inner.sent.insert(
            seqno,
            SentPacket {
                messages,
                send_time: now,
                last_sent: now,
                resend_asap: false,
                resent: false,
                callbacks,
                priority,
            },
        );
        inner.ack_requests.push(seqno, now + delay, now + delay + ACK_URGENCY);
    }

    /// Incoming datagram seqno. Returns true iff this seqno is new; the
    /// caller only processes the payload then. An ack is (re)queued either
    /// way, and any gap below a new highest seqno turns into resend requests.
    pub fn on_received_packet(&self, seqno: u32) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let prev_highest = inner.received.highest;
        inner.resend_requests.remove(seqno);
        let new = inner.received.mark(seqno);
        inner.acks.push(seqno, now, now + ACK_URGENCY);
        if new {
            if let Some(prev) = prev_highest {
                if seqno_newer(seqno, prev) {
                    let mut gap = prev.wrapping_add(1);
                    while gap != seqno {
                        if !inner.received.contains(gap) {
                            inner.resend_requests.push(
                                gap,
                                now,
                                now + self.config.max_coalescing_delay,
                            );
                        }
                        gap = gap.wrapping_add(1);
                    }
                }
            }
        } else {
            tracing::trace!(target: "transport", peer = %self.peer, seqno, "duplicate packet");
        }
        new
    }

    /// Peer acked one of our seqnos. Returns the RTT sample, if this ack
    /// yields one.
    pub fn on_acked(&self, seqno: u32) -> Option<time::Duration> {
        let now = self.clock.now();
        let (callbacks, rtt) = {
            let mut inner = self.inner.lock();
            let Some(packet) = inner.sent.remove(&seqno) else {
                inner.ack_requests.remove(seqno);
                return None;
            };
            inner.ack_requests.remove(seqno);
            // Karn's rule: a retransmitted packet's ack is ambiguous.
            let rtt = if packet.resent { None } else { Some(now - packet.send_time) };
            if let Some(sample) = rtt {
                inner.report_rtt(sample);
            }
            (packet.callbacks, rtt)
        };
        self.space.notify_waiters();
        let effective = rtt.unwrap_or_else(|| self.average_rtt());
        for cb in &callbacks {
            cb.acknowledged(effective);
        }
        rtt
    }

    pub fn on_acked_many(&self, seqnos: impl IntoIterator<Item = u32>) -> Option<time::Duration> {
        let mut last = None;
        for seqno in seqnos {
            last = self.on_acked(seqno).or(last);
        }
        last
    }

    /// Peer wants a retransmit. Unknown (window-evicted) seqnos are recorded
    /// as forgotten so the peer stops asking.
    pub fn on_resend_request(&self, seqno: u32) {
        let mut inner = self.inner.lock();
        match inner.sent.get_mut(&seqno) {
            Some(packet) => packet.resend_asap = true,
            None => {
                if !inner.forgotten.contains(&seqno) {
                    inner.forgotten.push(seqno);
                }
            }
        }
    }

    /// Peer wants to know whether we received a seqno of theirs.
    pub fn on_ack_request(&self, seqno: u32) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.received.contains(seqno) {
            inner.acks.push(seqno, now, now + ACK_URGENCY);
        } else {
            inner.resend_requests.push(seqno, now, now + self.config.max_coalescing_delay);
        }
    }

    /// Peer no longer has a seqno we keep requesting; stop asking.
    pub fn on_forgotten(&self, seqno: u32) {
        self.inner.lock().resend_requests.remove(seqno);
    }

    pub fn grab_acks(&self) -> Vec<u32> {
        let now = self.clock.now();
        self.inner.lock().acks.grab_active(now)
    }

    /// Due resend requests. Each grabbed request is requeued with a backoff
    /// so we keep asking until the packet arrives or is declared forgotten.
    pub fn grab_resend_requests(&self) -> Vec<u32> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let due = inner.resend_requests.grab_active(now);
        for &seqno in &due {
            inner.resend_requests.push(
                seqno,
                now + RESEND_REQUEST_BACKOFF,
                now + RESEND_REQUEST_BACKOFF + self.config.max_coalescing_delay,
            );
        }
        due
    }

    /// Due ack requests, requeued with a backoff until acked.
    pub fn grab_ack_requests(&self) -> Vec<u32> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let due = inner.ack_requests.grab_active(now);
        for &seqno in &due {
            inner.ack_requests.push(
                seqno,
                now + RESEND_REQUEST_BACKOFF,
                now + RESEND_REQUEST_BACKOFF + ACK_URGENCY,
            );
        }
        due
    }

    pub fn grab_forgotten(&self) -> Vec<u32> {
        std::mem::take(&mut self.inner.lock().forgotten)
    }

    /// Payloads to retransmit now: explicitly requested, rate-limited to one
    /// retransmit per 2·RTT.
    pub fn grab_resend_payloads(&self) -> Vec<(u32, Vec<Message>, Priority)> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let interval = inner.ack_request_delay();
        let mut out = Vec::new();
        for (&seqno, packet) in inner.sent.iter_mut() {
            if packet.resend_asap && now - packet.last_sent >= interval {
                packet.resend_asap = false;
                packet.resent = true;
                packet.last_sent = now;
                out.push((seqno, packet.messages.clone(), packet.priority));
            }
        }
        out.sort_by_key(|(seqno, _, _)| *seqno);
        out
    }

    /// Earliest deadline across all queues; the packet scheduler sleeps until
    /// then.
    pub fn next_urgent_time(&self) -> Option<time::Instant> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut next = inner.acks.next_urgent();
        for q in [&mut inner.resend_requests, &mut inner.ack_requests] {
            next = match (next, q.next_urgent()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        if !inner.forgotten.is_empty() {
            next = Some(next.map_or(self.clock.now(), |n| n.min(self.clock.now())));
        }
        let interval = inner.ack_request_delay();
        for packet in inner.sent.values() {
            if packet.resend_asap {
                let due = packet.last_sent + interval;
                next = Some(next.map_or(due, |n| n.min(due)));
            }
        }
        next
    }

    /// Rolling ack bitmask for the outgoing header.
    pub fn ack_bitmask(&self) -> Option<AckBitmask> {
        self.inner.lock().received.ack_bitmask()
    }

    pub fn average_rtt(&self) -> time::Duration {
        self.inner.lock().rtt()
    }

    /// Stops allocation; in-flight packets stay until acked or moved.
    pub fn deprecate(&self) {
        self.inner.lock().status = Status::Deprecated;
        self.space.notify_waiters();
    }

    /// Deprecates and drains every unacked payload, to be requeued on the
    /// successor tracker with callback continuity.
    pub fn completely_deprecated(&self) -> Vec<MessageItem> {
        let mut inner = self.inner.lock();
        inner.status = Status::Deprecated;
        let mut packets: Vec<(u32, SentPacket)> = inner.sent.drain().collect();
        packets.sort_by_key(|(seqno, _)| *seqno);
        inner.acks.clear();
        inner.resend_requests.clear();
        inner.ack_requests.clear();
        inner.forgotten.clear();
        drop(inner);
        self.space.notify_waiters();
        packets
            .into_iter()
            .map(|(_, p)| MessageItem {
                messages: p.messages,
                priority: p.priority,
                callbacks: p.callbacks,
            })
            .collect()
    }

    /// Session is gone for good: every outstanding payload's callbacks see
    /// `disconnected()`.
    pub fn disconnected(&self) {
        let packets: Vec<SentPacket> = {
            let mut inner = self.inner.lock();
            inner.status = Status::Disconnected;
            inner.acks.clear();
            inner.resend_requests.clear();
            inner.ack_requests.clear();
            inner.forgotten.clear();
            inner.sent.drain().map(|(_, p)| p).collect()
        };
        self.space.notify_waiters();
        for packet in &packets {
            for cb in &packet.callbacks {
                cb.disconnected();
            }
        }
        tracing::debug!(target: "transport", peer = %self.peer, dropped = packets.len(), "tracker disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_async::time::FakeClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker(clock: &FakeClock) -> KeyTracker {
        KeyTracker::new(clock.clock(), PeerId(1), TrackerConfig::default())
    }

    fn msg() -> Vec<Message> {
        vec![Message::Void]
    }

    #[derive(Default)]
    struct CountingCallback {
        acked: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl SentCallback for CountingCallback {
        fn acknowledged(&self, _rtt: time::Duration) {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }
        fn disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn seqnos_are_monotonic() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        for expected in 0..10 {
            let seqno = t.try_allocate_outgoing_seqno().unwrap();
            assert_eq!(seqno, expected);
            t.on_sent(seqno, msg(), vec![], Priority::Normal);
        }
    }

    #[test]
    fn window_fills_then_frees_on_ack() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        for _ in 0..SENT_WINDOW {
            let seqno = t.try_allocate_outgoing_seqno().unwrap();
            t.on_sent(seqno, msg(), vec![], Priority::Normal);
        }
        assert_eq!(t.try_allocate_outgoing_seqno(), Err(TrackerError::WouldBlock));
        t.on_acked(0);
        assert_eq!(t.try_allocate_outgoing_seqno(), Ok(SENT_WINDOW as u32));
    }

    #[test]
    fn duplicate_receive_is_idempotent_but_reacks() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        assert!(t.on_received_packet(5));
        assert_eq!(t.grab_acks(), vec![5]);
        assert!(!t.on_received_packet(5));
        // The ack is re-emitted for the duplicate.
        assert_eq!(t.grab_acks(), vec![5]);
    }

    #[test]
    fn gap_generates_resend_requests() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        assert!(t.on_received_packet(0));
        assert!(t.on_received_packet(3));
        let mut requests = t.grab_resend_requests();
        requests.sort();
        assert_eq!(requests, vec![1, 2]);
        // Backed off: not due again immediately.
        assert!(t.grab_resend_requests().is_empty());
        clock.advance(RESEND_REQUEST_BACKOFF);
        let mut requests = t.grab_resend_requests();
        requests.sort();
        assert_eq!(requests, vec![1, 2]);
        // Receiving one of them stops the requesting.
        assert!(t.on_received_packet(1));
        clock.advance(RESEND_REQUEST_BACKOFF);
        assert_eq!(t.grab_resend_requests(), vec![2]);
    }

    #[test]
    fn ack_request_goes_active_after_rtt_delay() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        let seqno = t.try_allocate_outgoing_seqno().unwrap();
        t.on_sent(seqno, msg(), vec![], Priority::Normal);
        assert!(t.grab_ack_requests().is_empty());
        // Initial RTT is 500ms, so the request activates at 2*RTT = 1s.
        clock.advance(time::Duration::milliseconds(1000));
        assert_eq!(t.grab_ack_requests(), vec![seqno]);
    }

    #[test]
    fn ack_fires_callbacks_and_clears_state() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        let cb = Arc::new(CountingCallback::default());
        let seqno = t.try_allocate_outgoing_seqno().unwrap();
        t.on_sent(seqno, msg(), vec![cb.clone()], Priority::Normal);
        clock.advance(time::Duration::milliseconds(120));
        let rtt = t.on_acked(seqno).unwrap();
        assert_eq!(rtt, time::Duration::milliseconds(120));
        assert_eq!(cb.acked.load(Ordering::SeqCst), 1);
        // Acking again is a no-op.
        assert_eq!(t.on_acked(seqno), None);
        assert_eq!(cb.acked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resend_request_schedules_payload() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        let seqno = t.try_allocate_outgoing_seqno().unwrap();
        t.on_sent(seqno, msg(), vec![], Priority::Normal);
        t.on_resend_request(seqno);
        // Rate limited: too soon after the original send.
        assert!(t.grab_resend_payloads().is_empty());
        clock.advance(time::Duration::milliseconds(1000));
        let resends = t.grab_resend_payloads();
        assert_eq!(resends.len(), 1);
        assert_eq!(resends[0].0, seqno);
        // An ack for a resent packet yields no RTT sample.
        assert_eq!(t.on_acked(seqno), None);
    }

    #[test]
    fn resend_request_for_unknown_seqno_is_forgotten() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        t.on_resend_request(9999);
        assert_eq!(t.grab_forgotten(), vec![9999]);
        assert!(t.grab_forgotten().is_empty());
    }

    #[test]
    fn ack_request_for_received_seqno_reacks() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        t.on_received_packet(1);
        t.grab_acks();
        t.on_ack_request(1);
        assert_eq!(t.grab_acks(), vec![1]);
        // Unknown seqno: ask for a resend instead.
        t.on_ack_request(2);
        assert_eq!(t.grab_resend_requests(), vec![2]);
    }

    #[test]
    fn deprecation_blocks_allocation_and_moves_payloads() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        let cb = Arc::new(CountingCallback::default());
        for _ in 0..3 {
            let seqno = t.try_allocate_outgoing_seqno().unwrap();
            t.on_sent(seqno, msg(), vec![cb.clone()], Priority::Normal);
        }
        let items = t.completely_deprecated();
        assert_eq!(items.len(), 3);
        assert_eq!(t.try_allocate_outgoing_seqno(), Err(TrackerError::KeyChanged));
        // Callbacks move with the payloads: no disconnects fired.
        assert_eq!(cb.disconnected.load(Ordering::SeqCst), 0);
        let successor = tracker(&clock);
        for item in items {
            let seqno = successor.try_allocate_outgoing_seqno().unwrap();
            successor.on_sent(seqno, item.messages, item.callbacks, item.priority);
        }
        successor.on_acked_many(0..3);
        assert_eq!(cb.acked.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn disconnect_fires_disconnected_once_per_payload() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        let cb = Arc::new(CountingCallback::default());
        let seqno = t.try_allocate_outgoing_seqno().unwrap();
        t.on_sent(seqno, msg(), vec![cb.clone()], Priority::Normal);
        t.disconnected();
        assert_eq!(cb.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(t.try_allocate_outgoing_seqno(), Err(TrackerError::NotConnected));
        // State is cleared; a late ack does nothing.
        assert_eq!(t.on_acked(seqno), None);
        assert_eq!(cb.acked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blocking_allocation_wakes_on_ack() {
        let clock = FakeClock::default();
        let t = Arc::new(tracker(&clock));
        for _ in 0..SENT_WINDOW {
            let seqno = t.try_allocate_outgoing_seqno().unwrap();
            t.on_sent(seqno, msg(), vec![], Priority::Normal);
        }
        let waiter = tokio::spawn({
            let t = t.clone();
            async move { t.allocate_outgoing_seqno().await }
        });
        tokio::task::yield_now().await;
        t.on_acked(7);
        assert_eq!(waiter.await.unwrap(), Ok(SENT_WINDOW as u32));
    }

    #[test]
    fn received_window_slides() {
        let mut w = ReceivedWindow::new();
        assert!(w.mark(0));
        assert!(w.mark(600));
        // 0 fell out of the window but still reads as seen.
        assert!(w.contains(0));
        assert!(w.contains(600));
        assert!(!w.contains(599));
        assert!(w.mark(599));
        assert!(w.contains(599));
    }

    #[test]
    fn received_window_wraps_around_zero() {
        let mut w = ReceivedWindow::new();
        assert!(w.mark(u32::MAX));
        assert!(w.mark(0));
        assert!(w.contains(u32::MAX));
        assert!(w.contains(0));
        assert!(!w.contains(1));
    }

    #[test]
    fn ack_bitmask_covers_recent_seqnos() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        t.on_received_packet(10);
        t.on_received_packet(12);
        let mask = t.ack_bitmask().unwrap();
        assert_eq!(mask.base, 13);
        let seqnos: Vec<u32> = mask.seqnos().collect();
        assert!(seqnos.contains(&12));
        assert!(seqnos.contains(&10));
        assert!(!seqnos.contains(&11));
    }

    #[test]
    fn next_urgent_time_tracks_pending_acks() {
        let clock = FakeClock::default();
        let t = tracker(&clock);
        assert_eq!(t.next_urgent_time(), None);
        t.on_received_packet(1);
        let urgent = t.next_urgent_time().unwrap();
        assert_eq!(urgent, clock.now() + ACK_URGENCY);
        t.grab_acks();
        assert_eq!(t.next_urgent_time(), None);
    }
}
