use gyre_async::time;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// One pending transport item (an ack, a resend request, or an ack request)
/// keyed by seqno.
///
/// `active` is the earliest time the item may be piggybacked on an outgoing
/// datagram; `urgent` is when the scheduler must force a datagram out for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    active: time::Instant,
    urgent: time::Instant,
}

/// Queue of seqno-keyed items ordered by time: a hash map for O(1) removal by
/// seqno plus lazily-invalidated heaps for the two time orders.
#[derive(Default)]
pub(crate) struct PacketQueue {
    items: HashMap<u32, Slot>,
    by_active: BinaryHeap<Reverse<(time::Instant, u32)>>,
    by_urgent: BinaryHeap<Reverse<(time::Instant, u32)>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            by_active: BinaryHeap::new(),
            by_urgent: BinaryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Inserts or reschedules. Re-inserting an existing seqno keeps the
    /// earlier urgent time, so repeated enqueues cannot push urgency out.
    pub fn push(&mut self, seqno: u32, active: time::Instant, urgent: time::Instant) {
        let slot = match self.items.get(&seqno) {
            Some(old) => Slot { active, urgent: old.urgent.min(urgent) },
            None => Slot { active, urgent },
        };
        self.items.insert(seqno, slot);
        self.by_active.push(Reverse((slot.active, seqno)));
        self.by_urgent.push(Reverse((slot.urgent, seqno)));
    }

    pub fn remove(&mut self, seqno: u32) -> bool {
        self.items.remove(&seqno).is_some()
    }

    /// Removes and returns every item whose active time has arrived.
    pub fn grab_active(&mut self, now: time::Instant) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(&Reverse((active, seqno))) = self.by_active.peek() {
            if active > now {
                break;
            }
            self.by_active.pop();
            // Stale heap entry: the item was removed or rescheduled.
            if self.items.get(&seqno).is_some_and(|slot| slot.active == active) {
                self.items.remove(&seqno);
                out.push(seqno);
            }
        }
        out
    }

    /// Earliest urgent time across live items.
    pub fn next_urgent(&mut self) -> Option<time::Instant> {
        while let Some(&Reverse((urgent, seqno))) = self.by_urgent.peek() {
            if self.items.get(&seqno).is_some_and(|slot| slot.urgent == urgent) {
                return Some(urgent);
            }
            self.by_urgent.pop();
        }
        None
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.by_active.clear();
        self.by_urgent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn t(ms: i64) -> time::Instant {
        time::Instant::ZERO + Duration::milliseconds(ms)
    }

    #[test]
    fn grab_respects_active_time() {
        let mut q = PacketQueue::new();
        q.push(1, t(0), t(200));
        q.push(2, t(100), t(300));
        assert_eq!(q.grab_active(t(50)), vec![1]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.grab_active(t(100)), vec![2]);
        assert!(q.grab_active(t(1000)).is_empty());
    }

    #[test]
    fn remove_invalidates_heap_entries() {
        let mut q = PacketQueue::new();
        q.push(1, t(0), t(200));
        q.push(2, t(0), t(100));
        assert!(q.remove(2));
        assert_eq!(q.grab_active(t(0)), vec![1]);
        assert_eq!(q.next_urgent(), None);
    }

    #[test]
    fn reinsert_keeps_earlier_urgency() {
        let mut q = PacketQueue::new();
        q.push(1, t(0), t(100));
        q.push(1, t(500), t(1000));
        assert_eq!(q.next_urgent(), Some(t(100)));
        // But the new active time applies.
        assert!(q.grab_active(t(0)).is_empty());
        assert_eq!(q.grab_active(t(500)), vec![1]);
    }

    #[test]
    fn next_urgent_is_minimum() {
        let mut q = PacketQueue::new();
        q.push(3, t(10), t(500));
        q.push(4, t(10), t(50));
        q.push(5, t(10), t(900));
        assert_eq!(q.next_urgent(), Some(t(50)));
        q.remove(4);
        assert_eq!(q.next_urgent(), Some(t(500)));
    }
}
