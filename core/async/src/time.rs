//! Time module provides a non-global clock, which should be passed
//! as an argument to functions which need to read the current time.
//! In particular try to avoid storing the clock instances in the objects.
//! Functions which use system clock directly are non-deterministic.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::Arc;
use std::task::Waker;

pub type Utc = time::OffsetDateTime;
pub type Duration = time::Duration;

/// Process-wide anchor for the real clock, so that `Instant`s minted by
/// independent `Clock::real()` instances are mutually comparable.
static REAL_EPOCH: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);

/// Monotonic timestamp: a signed offset from the clock's epoch.
/// Unlike `std::time::Instant` it supports arithmetic with the (signed)
/// `time::Duration` and can be minted deterministically by `FakeClock`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(Duration);

impl Instant {
    pub const ZERO: Instant = Instant(Duration::ZERO);

    pub fn signed_duration_since(self, earlier: Instant) -> Duration {
        self.0 - earlier.0
    }

    /// Duration elapsed from `earlier`, saturating at zero.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        (self.0 - earlier.0).max(Duration::ZERO)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, d: Duration) -> Instant {
        Instant(self.0 + d)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        self.0 += d;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, d: Duration) -> Instant {
        Instant(self.0 - d)
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, d: Duration) {
        self.0 -= d;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;
    fn sub(self, other: Instant) -> Duration {
        self.0 - other.0
    }
}

/// Clock encapsulates a system clock, allowing to replace it
/// with a fake in tests.
/// Since system clock is a source of external information,
/// it has to be replaced with a fake double, if we want our
/// tests to be deterministic.
#[derive(Clone)]
pub struct Clock(ClockInner);

#[derive(Clone)]
enum ClockInner {
    Real,
    Fake(FakeClock),
}

impl Clock {
    /// Constructor of the real clock. Use it in production code.
    /// Preferably construct it directly in the main() function,
    /// so that it can be faked out in every other function.
    pub fn real() -> Clock {
        Lazy::force(&REAL_EPOCH);
        Clock(ClockInner::Real)
    }

    /// Current time according to the monotonic clock.
    pub fn now(&self) -> Instant {
        match &self.0 {
            ClockInner::Real => Instant(REAL_EPOCH.elapsed().try_into().unwrap_or(Duration::MAX)),
            ClockInner::Fake(fake) => fake.now(),
        }
    }

    /// Current time according to the system/walltime clock.
    pub fn now_utc(&self) -> Utc {
        match &self.0 {
            ClockInner::Real => Utc::now_utc(),
            ClockInner::Fake(fake) => fake.now_utc(),
        }
    }

    /// Cancellable.
    pub async fn sleep_until(&self, t: Instant) {
        match &self.0 {
            ClockInner::Real => {
                let now = self.now();
                if t > now {
                    let d: std::time::Duration =
                        (t - now).try_into().unwrap_or(std::time::Duration::ZERO);
                    tokio::time::sleep(d).await;
                }
            }
            ClockInner::Fake(fake) => fake.sleep_until(t).await,
        }
    }

    /// Cancellable.
    pub async fn sleep(&self, d: Duration) {
        let deadline = self.now() + d;
        self.sleep_until(deadline).await;
    }
}

struct FakeClockInner {
    now: Instant,
    utc: Utc,
    /// Sleeping futures, woken whenever the clock advances past their deadline.
    waiters: Vec<(Instant, Waker)>,
}

/// TEST-ONLY (deterministic tests): a clock which only moves when `advance()`
/// is called. `sleep()` futures complete once the clock has been advanced past
/// their deadline.
#[derive(Clone)]
pub struct FakeClock(Arc<Mutex<FakeClockInner>>);

impl FakeClock {
    pub fn new(utc: Utc) -> Self {
        Self(Arc::new(Mutex::new(FakeClockInner {
            now: Instant::ZERO,
            utc,
            waiters: Vec::new(),
        })))
    }

    /// Returns a clock reading from this fake.
    pub fn clock(&self) -> Clock {
        Clock(ClockInner::Fake(self.clone()))
    }

    pub fn now(&self) -> Instant {
        self.0.lock().now
    }

    pub fn now_utc(&self) -> Utc {
        self.0.lock().utc
    }

    /// Advances the clock by `d` and wakes every sleeper whose deadline has
    /// been reached. Advancing by a negative duration is a bug.
    pub fn advance(&self, d: Duration) {
        assert!(d >= Duration::ZERO);
        let mut inner = self.0.lock();
        inner.now += d;
        inner.utc += d;
        let now = inner.now;
        let mut i = 0;
        while i < inner.waiters.len() {
            if inner.waiters[i].0 <= now {
                inner.waiters.swap_remove(i).1.wake();
            } else {
                i += 1;
            }
        }
    }

    pub fn set_utc(&self, utc: Utc) {
        self.0.lock().utc = utc;
    }

    fn sleep_until(&self, deadline: Instant) -> FakeSleep {
        FakeSleep { clock: self.clone(), deadline }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Utc::UNIX_EPOCH + Duration::days(365 * 50))
    }
}

struct FakeSleep {
    clock: FakeClock,
    deadline: Instant,
}

impl std::future::Future for FakeSleep {
    type Output = ();
    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        let mut inner = self.clock.0.lock();
        if inner.now >= self.deadline {
            return std::task::Poll::Ready(());
        }
        inner.waiters.push((self.deadline, cx.waker().clone()));
        std::task::Poll::Pending
    }
}

/// Periodic ticker bound to an explicit clock.
pub struct Interval {
    next: Instant,
    period: Duration,
}

impl Interval {
    pub fn new(next: Instant, period: Duration) -> Self {
        Self { next, period }
    }

    /// Cancel-safe.
    pub async fn tick(&mut self, clock: &Clock) {
        clock.sleep_until(self.next).await;
        // Strict equality to avoid busy looping when the clock is fake and
        // stands still.
        self.next = clock.now().max(self.next) + self.period;
    }
}
