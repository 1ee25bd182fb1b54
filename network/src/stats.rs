//! Load and admission signals. The dispatcher consults
//! [`NodeStats::should_reject_request`] before spawning a handler; everything
//! else here is the bookkeeping feeding that decision.

use gyre_async::time;
use parking_lot::Mutex;

/// Preemptive rejection reasons, reported upstream as `RejectedOverload`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::IntoStaticStr)]
pub enum RejectReason {
    BandwidthLiability,
    PingTime,
    QueueBacklog,
}

/// Above this estimated bandwidth-limit delay, new work is refused.
const MAX_BANDWIDTH_DELAY: time::Duration = time::Duration::seconds(2);
/// Ping thresholds; subspace traffic is held to the stricter bound because
/// its requests are cheap to retry elsewhere.
const MAX_PING: time::Duration = time::Duration::milliseconds(1500);
const MAX_PING_SSK: time::Duration = time::Duration::milliseconds(1000);
/// Refuse when this many inbound messages sit unclaimed.
const MAX_UNCLAIMED: usize = 500;
/// At least one CHK request is admitted per this window, whatever the load,
/// so bandwidth-delay measurements keep flowing.
const CHK_ADMISSION_WINDOW: time::Duration = time::Duration::seconds(1);

struct Inner {
    bandwidth_delay: time::Duration,
    avg_ping: time::Duration,
    unclaimed_fifo: usize,
    last_chk_admitted: Option<time::Instant>,
    accepted: u64,
    rejected: u64,
}

pub struct NodeStats {
    clock: time::Clock,
    inner: Mutex<Inner>,
}

impl NodeStats {
    pub fn new(clock: time::Clock) -> NodeStats {
        NodeStats {
            clock,
            inner: Mutex::new(Inner {
                bandwidth_delay: time::Duration::ZERO,
                avg_ping: time::Duration::ZERO,
                unclaimed_fifo: 0,
                last_chk_admitted: None,
                accepted: 0,
                rejected: 0,
            }),
        }
    }

    /// Admission control for an incoming request or insert. `None` accepts.
    pub fn should_reject_request(&self, is_insert: bool, is_ssk: bool) -> Option<RejectReason> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let reason = self.check(&inner, is_insert, is_ssk);
        if reason.is_some() && !is_insert && !is_ssk {
            // Guaranteed CHK trickle.
            let due = inner
                .last_chk_admitted
                .is_none_or(|last| now - last >= CHK_ADMISSION_WINDOW);
            if due {
                inner.last_chk_admitted = Some(now);
                inner.accepted += 1;
                return None;
            }
        }
        match reason {
            Some(reason) => {
                inner.rejected += 1;
                tracing::debug!(target: "network", reason = <&'static str>::from(reason), is_insert, is_ssk, "preemptive rejection");
                Some(reason)
            }
            None => {
                if !is_insert && !is_ssk {
                    inner.last_chk_admitted = Some(now);
                }
                inner.accepted += 1;
                None
            }
        }
    }

    fn check(&self, inner: &Inner, is_insert: bool, is_ssk: bool) -> Option<RejectReason> {
        if inner.bandwidth_delay > MAX_BANDWIDTH_DELAY {
            return Some(RejectReason::BandwidthLiability);
        }
        let ping_limit = if is_ssk || is_insert { MAX_PING_SSK } else { MAX_PING };
        if inner.avg_ping > time::Duration::ZERO && inner.avg_ping > ping_limit {
            return Some(RejectReason::PingTime);
        }
        if inner.unclaimed_fifo > MAX_UNCLAIMED {
            return Some(RejectReason::QueueBacklog);
        }
        None
    }

    pub fn report_bandwidth_delay(&self, delay: time::Duration) {
        self.inner.lock().bandwidth_delay = delay;
    }

    pub fn report_avg_ping(&self, ping: time::Duration) {
        self.inner.lock().avg_ping = ping;
    }

    pub fn set_unclaimed_fifo(&self, size: usize) {
        self.inner.lock().unclaimed_fifo = size;
    }

    /// (accepted, rejected) counters.
    pub fn admission_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.accepted, inner.rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_async::time::FakeClock;

    #[test]
    fn accepts_when_unloaded() {
        let clock = FakeClock::default();
        let stats = NodeStats::new(clock.clock());
        assert_eq!(stats.should_reject_request(false, false), None);
        assert_eq!(stats.should_reject_request(true, true), None);
    }

    #[test]
    fn rejects_on_high_ping_but_admits_chk_trickle() {
        let clock = FakeClock::default();
        let stats = NodeStats::new(clock.clock());
        stats.report_avg_ping(time::Duration::seconds(3));
        // SSKs are refused outright.
        assert_eq!(stats.should_reject_request(false, true), Some(RejectReason::PingTime));
        // The first CHK in the window still gets through.
        assert_eq!(stats.should_reject_request(false, false), None);
        assert_eq!(stats.should_reject_request(false, false), Some(RejectReason::PingTime));
        // A window later the trickle readmits one.
        clock.advance(CHK_ADMISSION_WINDOW);
        assert_eq!(stats.should_reject_request(false, false), None);
    }

    #[test]
    fn ssk_ping_bound_is_stricter() {
        let clock = FakeClock::default();
        let stats = NodeStats::new(clock.clock());
        stats.report_avg_ping(time::Duration::milliseconds(1200));
        assert_eq!(stats.should_reject_request(false, false), None);
        assert_eq!(stats.should_reject_request(false, true), Some(RejectReason::PingTime));
    }

    #[test]
    fn queue_backlog_rejects() {
        let clock = FakeClock::default();
        let stats = NodeStats::new(clock.clock());
        stats.set_unclaimed_fifo(10_000);
        assert_eq!(stats.should_reject_request(true, false), Some(RejectReason::QueueBacklog));
    }

    #[test]
    fn bandwidth_liability_rejects() {
        let clock = FakeClock::default();
        let stats = NodeStats::new(clock.clock());
        stats.report_bandwidth_delay(time::Duration::seconds(5));
        assert_eq!(stats.should_reject_request(false, true), Some(RejectReason::BandwidthLiability));
    }
}
