//! Process-wide set of in-flight request identifiers, plus the bounded
//! window of recently completed ones used for loop rejection.

use gyre_async::time;
use gyre_primitives::network::Uid;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What a UID is locked for. A data request and an insert for the same UID
/// are distinct handlers and may not coexist either; the kind is part of the
/// lock key only so diagnostics can tell them apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, strum::IntoStaticStr)]
pub enum UidKind {
    ChkRequest,
    SskRequest,
    ChkInsert,
    SskInsert,
    OfferedKey,
}

struct Inner {
    locked: HashSet<Uid>,
    completed: LruCache<Uid, time::Instant>,
}

pub struct UidRegistry {
    clock: time::Clock,
    /// Completed UIDs are rejected as loops for at least this long.
    reject_time: time::Duration,
    inner: Mutex<Inner>,
}

impl UidRegistry {
    pub fn new(clock: time::Clock, reject_time: time::Duration, window_size: usize) -> Arc<Self> {
        Arc::new(UidRegistry {
            clock,
            reject_time,
            inner: Mutex::new(Inner {
                locked: HashSet::new(),
                completed: LruCache::new(NonZeroUsize::new(window_size.max(1)).unwrap()),
            }),
        })
    }

    /// Claims a UID for a handler. At most one handler per UID, across all
    /// kinds.
    pub fn try_lock(self: &Arc<Self>, uid: Uid, kind: UidKind) -> Option<UidLock> {
        let mut inner = self.inner.lock();
        if !inner.locked.insert(uid) {
            return None;
        }
        Some(UidLock { registry: self.clone(), uid, kind, terminal: AtomicBool::new(true) })
    }

    /// Did a request with this UID complete within the reject window?
    pub fn recently_completed(&self, uid: Uid) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.completed.peek(&uid).copied() {
            Some(at) if now - at < self.reject_time => true,
            Some(_) => {
                // Past the minimum retention; free the slot.
                inner.completed.pop(&uid);
                false
            }
            None => false,
        }
    }

    pub fn locked_count(&self) -> usize {
        self.inner.lock().locked.len()
    }

    fn unlock(&self, uid: Uid, kind: UidKind, terminal: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.locked.remove(&uid);
        if terminal {
            inner.completed.put(uid, now);
        }
        tracing::trace!(target: "network", %uid, kind = <&'static str>::from(kind), terminal, "uid unlocked");
    }
}

/// RAII lock on a UID. Dropping unlocks; by default the UID is recorded as
/// completed (terminal), so any re-arrival within the reject window bounces
/// with `RejectedLoop`. Preemptive rejections release non-terminally instead,
/// since the originator may legitimately route the same UID through us again.
pub struct UidLock {
    registry: Arc<UidRegistry>,
    uid: Uid,
    kind: UidKind,
    terminal: AtomicBool,
}

impl UidLock {
    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn kind(&self) -> UidKind {
        self.kind
    }

    /// Releases without recording completion.
    pub fn release_non_terminal(self) {
        self.terminal.store(false, Ordering::SeqCst);
    }
}

impl Drop for UidLock {
    fn drop(&mut self) {
        self.registry.unlock(self.uid, self.kind, self.terminal.load(Ordering::SeqCst));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_async::time::FakeClock;

    fn registry(clock: &FakeClock) -> Arc<UidRegistry> {
        UidRegistry::new(clock.clock(), time::Duration::minutes(10), 4)
    }

    #[test]
    fn second_lock_for_same_uid_fails() {
        let clock = FakeClock::default();
        let r = registry(&clock);
        let lock = r.try_lock(Uid(1), UidKind::ChkRequest).unwrap();
        assert!(r.try_lock(Uid(1), UidKind::ChkRequest).is_none());
        // Even under a different kind.
        assert!(r.try_lock(Uid(1), UidKind::ChkInsert).is_none());
        drop(lock);
        assert!(r.try_lock(Uid(1), UidKind::ChkInsert).is_some());
    }

    #[test]
    fn terminal_unlock_enters_reject_window() {
        let clock = FakeClock::default();
        let r = registry(&clock);
        assert!(!r.recently_completed(Uid(1)));
        drop(r.try_lock(Uid(1), UidKind::ChkRequest).unwrap());
        assert!(r.recently_completed(Uid(1)));
        // Still rejected just inside the window, free just past it.
        clock.advance(time::Duration::minutes(9));
        assert!(r.recently_completed(Uid(1)));
        clock.advance(time::Duration::minutes(2));
        assert!(!r.recently_completed(Uid(1)));
    }

    #[test]
    fn non_terminal_release_skips_reject_window() {
        let clock = FakeClock::default();
        let r = registry(&clock);
        let lock = r.try_lock(Uid(1), UidKind::SskRequest).unwrap();
        lock.release_non_terminal();
        assert!(!r.recently_completed(Uid(1)));
        assert!(r.try_lock(Uid(1), UidKind::SskRequest).is_some());
    }

    #[test]
    fn completed_window_is_size_bounded() {
        let clock = FakeClock::default();
        let r = registry(&clock);
        for i in 0..6u64 {
            drop(r.try_lock(Uid(i), UidKind::ChkRequest).unwrap());
        }
        // Window size 4: the two oldest have been evicted.
        assert!(!r.recently_completed(Uid(0)));
        assert!(!r.recently_completed(Uid(1)));
        assert!(r.recently_completed(Uid(5)));
    }
}
