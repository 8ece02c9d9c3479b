//! Clocks and running time.
//!
//! A [`Clock`] reports a monotonically increasing [`ClockTime`] and lets a
//! streaming thread sleep until a given time through a [`ClockId`], which
//! another thread can unschedule. [`SystemClock`] follows real time;
//! [`TestClock`] only moves when a test tells it to.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A point or span on a clock, in nanoseconds.
///
/// `u64::MAX` is reserved for [`ClockTime::NONE`], the unset value carried
/// by buffers without timestamps. Arithmetic saturates and propagates NONE.
///
/// ```rust
/// use sluice::clock::ClockTime;
///
/// let t = ClockTime::from_secs(61) + ClockTime::from_millis(250);
/// assert_eq!(t.to_string(), "0:01:01.250000000");
/// assert!((t + ClockTime::NONE).is_none());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime(u64);

const NANOS_PER_SEC: u64 = 1_000_000_000;

impl ClockTime {
    /// The start of the clock.
    pub const ZERO: Self = Self(0);
    /// Unset time.
    pub const NONE: Self = Self(u64::MAX);

    /// From nanoseconds.
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// From milliseconds, saturating below NONE.
    pub const fn from_millis(ms: u64) -> Self {
        Self::clamped(ms as u128 * 1_000_000)
    }

    /// From seconds, saturating below NONE.
    pub const fn from_secs(s: u64) -> Self {
        Self::clamped(s as u128 * NANOS_PER_SEC as u128)
    }

    const fn clamped(ns: u128) -> Self {
        if ns >= u64::MAX as u128 {
            Self(u64::MAX - 1)
        } else {
            Self(ns as u64)
        }
    }

    /// Nanoseconds, `u64::MAX` for NONE.
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Whether this is [`ClockTime::NONE`].
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Whether this holds a time.
    pub const fn is_some(self) -> bool {
        !self.is_none()
    }

    /// `None` for NONE, otherwise `Some(self)`.
    pub const fn to_option(self) -> Option<Self> {
        if self.is_none() { None } else { Some(self) }
    }

    /// Sum, NONE if either side is NONE. Never overflows into NONE.
    pub const fn saturating_add(self, rhs: Self) -> Self {
        if self.is_none() || rhs.is_none() {
            Self::NONE
        } else {
            Self::clamped(self.0 as u128 + rhs.0 as u128)
        }
    }

    /// Difference clamped at zero, NONE if either side is NONE.
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        if self.is_none() || rhs.is_none() {
            Self::NONE
        } else {
            Self(self.0.saturating_sub(rhs.0))
        }
    }
}

impl std::ops::Add for ClockTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl std::ops::Sub for ClockTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl From<Duration> for ClockTime {
    fn from(d: Duration) -> Self {
        Self::clamped(d.as_nanos())
    }
}

impl From<ClockTime> for Duration {
    /// NONE converts to a zero duration.
    fn from(t: ClockTime) -> Self {
        t.to_option()
            .map_or(Duration::ZERO, |t| Duration::from_nanos(t.0))
    }
}

impl std::fmt::Display for ClockTime {
    /// `h:mm:ss.nnnnnnnnn`, or `NONE`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            return f.write_str("NONE");
        }
        let secs = self.0 / NANOS_PER_SEC;
        write!(
            f,
            "{}:{:02}:{:02}.{:09}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.0 % NANOS_PER_SEC
        )
    }
}

// ============================================================================
// Clock Ids
// ============================================================================

/// Outcome of waiting on a [`ClockId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClockReturn {
    /// The target time was reached.
    Ok,
    /// The target time had already passed when the wait started.
    Early,
    /// The wait was cancelled with [`ClockId::unschedule`].
    Unscheduled,
    /// The id carried an invalid time.
    BadTime,
}

#[derive(Default)]
struct ClockIdState {
    unscheduled: bool,
}

struct ClockIdInner {
    time: ClockTime,
    state: Mutex<ClockIdState>,
    cond: Condvar,
}

/// A single-shot wait request against a clock.
///
/// Sinks keep the id of their current wait so that a flush or a state change
/// can cancel it from another thread.
#[derive(Clone)]
pub struct ClockId {
    inner: Arc<ClockIdInner>,
}

impl ClockId {
    /// Create a wait request for the given clock time.
    pub fn new(time: ClockTime) -> Self {
        Self {
            inner: Arc::new(ClockIdInner {
                time,
                state: Mutex::new(ClockIdState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// The clock time this id waits for.
    pub fn time(&self) -> ClockTime {
        self.inner.time
    }

    /// Cancel the wait. A current or future `wait` returns `Unscheduled`.
    pub fn unschedule(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.unscheduled = true;
        self.inner.cond.notify_all();
    }

    /// Whether the id has been unscheduled.
    pub fn is_unscheduled(&self) -> bool {
        self.inner.state.lock().unwrap().unscheduled
    }

    /// Wake waiters so they re-check the clock.
    fn wake(&self) {
        let _state = self.inner.state.lock().unwrap();
        self.inner.cond.notify_all();
    }

    fn same(&self, other: &ClockId) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ClockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockId")
            .field("time", &self.inner.time)
            .field("unscheduled", &self.is_unscheduled())
            .finish()
    }
}

// ============================================================================
// Clock Trait
// ============================================================================

/// A clock that provides the current time and blocking waits against it.
///
/// This is the whole contract an element needs to satisfy to act as the
/// pipeline clock. Implementations must be monotonic.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> ClockTime;

    /// Get a human-readable name for the clock.
    fn name(&self) -> &str {
        "unknown"
    }

    /// Create a single-shot wait request for `time`.
    fn new_single_shot_id(&self, time: ClockTime) -> ClockId {
        ClockId::new(time)
    }

    /// Block until the clock reaches the id's time or the id is unscheduled.
    ///
    /// The default implementation assumes the clock advances at the rate of
    /// real time and sleeps on the id's condition variable.
    fn wait(&self, id: &ClockId) -> ClockReturn {
        let target = id.time();
        if target.is_none() {
            return ClockReturn::BadTime;
        }

        let mut state = id.inner.state.lock().unwrap();
        if !state.unscheduled && self.now() >= target {
            return ClockReturn::Early;
        }
        loop {
            if state.unscheduled {
                return ClockReturn::Unscheduled;
            }
            let now = self.now();
            if now >= target {
                return ClockReturn::Ok;
            }
            let remaining: Duration = (target - now).into();
            state = id.inner.cond.wait_timeout(state, remaining).unwrap().0;
        }
    }
}

impl std::fmt::Debug for dyn Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("name", &self.name()).finish()
    }
}

// ============================================================================
// SystemClock
// ============================================================================

/// Real-time clock backed by [`Instant`], counting from its creation.
///
/// This is what a pipeline falls back to when no element provides a clock.
pub struct SystemClock {
    epoch: Instant,
    name: String,
}

impl SystemClock {
    /// A clock reading zero now.
    pub fn new() -> Self {
        Self::with_name("system")
    }

    /// Same as [`SystemClock::new`], reporting `name` in logs.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            epoch: Instant::now(),
            name: name.into(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> ClockTime {
        ClockTime::from(self.epoch.elapsed())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// TestClock
// ============================================================================

/// A clock whose time only moves when [`TestClock::set_time`] or
/// [`TestClock::advance`] is called.
///
/// Waiters are tracked so a test can block until an element is sleeping on
/// the clock before advancing it.
pub struct TestClock {
    time: Mutex<ClockTime>,
    pending: Mutex<Vec<ClockId>>,
    pending_changed: Condvar,
}

impl TestClock {
    /// Create a test clock starting at zero.
    pub fn new() -> Self {
        Self::with_start_time(ClockTime::ZERO)
    }

    /// Create a test clock starting at `start`.
    pub fn with_start_time(start: ClockTime) -> Self {
        Self {
            time: Mutex::new(start),
            pending: Mutex::new(Vec::new()),
            pending_changed: Condvar::new(),
        }
    }

    /// Set the current time. Moving backwards is ignored.
    pub fn set_time(&self, time: ClockTime) {
        {
            let mut now = self.time.lock().unwrap();
            if time <= *now {
                return;
            }
            *now = time;
        }
        let waiters = self.pending.lock().unwrap().clone();
        for id in waiters {
            id.wake();
        }
    }

    /// Advance the current time by `delta`.
    pub fn advance(&self, delta: ClockTime) {
        let target = self.now() + delta;
        self.set_time(target);
    }

    /// Number of ids currently blocked in `wait`.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Block until at least `count` ids are waiting, or `timeout` elapses.
    ///
    /// Returns whether the count was reached.
    pub fn wait_for_pending(&self, count: usize, timeout: Duration) -> bool {
        let pending = self.pending.lock().unwrap();
        let (pending, _) = self
            .pending_changed
            .wait_timeout_while(pending, timeout, |p| p.len() < count)
            .unwrap();
        pending.len() >= count
    }

    fn register(&self, id: &ClockId) {
        self.pending.lock().unwrap().push(id.clone());
        self.pending_changed.notify_all();
    }

    fn unregister(&self, id: &ClockId) {
        self.pending.lock().unwrap().retain(|p| !p.same(id));
        self.pending_changed.notify_all();
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> ClockTime {
        *self.time.lock().unwrap()
    }

    fn name(&self) -> &str {
        "test-clock"
    }

    fn wait(&self, id: &ClockId) -> ClockReturn {
        let target = id.time();
        if target.is_none() {
            return ClockReturn::BadTime;
        }
        if self.now() >= target {
            return ClockReturn::Early;
        }

        self.register(id);
        let mut state = id.inner.state.lock().unwrap();
        let ret = loop {
            if state.unscheduled {
                break ClockReturn::Unscheduled;
            }
            if self.now() >= target {
                break ClockReturn::Ok;
            }
            state = id.inner.cond.wait(state).unwrap();
        };
        drop(state);
        self.unregister(id);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_clock_time_arithmetic() {
        let a = ClockTime::from_millis(1500);
        let b = ClockTime::from_secs(1);
        assert_eq!(a - b, ClockTime::from_millis(500));
        assert_eq!(b - a, ClockTime::ZERO);
        assert!((a + ClockTime::NONE).is_none());
        assert!((ClockTime::NONE - a).is_none());

        let huge = ClockTime::from_secs(u64::MAX);
        assert!(huge.is_some());
        assert!((huge + huge).is_some());

        assert_eq!(a.to_string(), "0:00:01.500000000");
        assert_eq!(ClockTime::from_secs(3723).to_string(), "1:02:03.000000000");
        assert_eq!(ClockTime::NONE.to_string(), "NONE");
        assert_eq!(Duration::from(ClockTime::NONE), Duration::ZERO);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_system_clock_wait() {
        let clock = SystemClock::new();
        let id = clock.new_single_shot_id(clock.now() + ClockTime::from_millis(20));
        let start = Instant::now();
        assert_eq!(clock.wait(&id), ClockReturn::Ok);
        assert!(start.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn test_wait_in_the_past_is_early() {
        let clock = SystemClock::new();
        let id = clock.new_single_shot_id(ClockTime::ZERO);
        assert_eq!(clock.wait(&id), ClockReturn::Early);
    }

    #[test]
    fn test_unschedule_interrupts_wait() {
        let clock = Arc::new(SystemClock::new());
        let id = clock.new_single_shot_id(clock.now() + ClockTime::from_secs(60));

        let waiter = {
            let clock = clock.clone();
            let id = id.clone();
            thread::spawn(move || clock.wait(&id))
        };

        thread::sleep(Duration::from_millis(20));
        id.unschedule();
        assert_eq!(waiter.join().unwrap(), ClockReturn::Unscheduled);
    }

    #[test]
    fn test_test_clock_advance_wakes_waiter() {
        let clock = Arc::new(TestClock::new());
        let id = clock.new_single_shot_id(ClockTime::from_secs(1));

        let waiter = {
            let clock = clock.clone();
            let id = id.clone();
            thread::spawn(move || clock.wait(&id))
        };

        assert!(clock.wait_for_pending(1, Duration::from_secs(5)));
        clock.advance(ClockTime::from_millis(500));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.pending_count(), 1);

        clock.advance(ClockTime::from_millis(500));
        assert_eq!(waiter.join().unwrap(), ClockReturn::Ok);
        assert_eq!(clock.pending_count(), 0);
    }

    #[test]
    fn test_test_clock_ignores_backwards() {
        let clock = TestClock::with_start_time(ClockTime::from_secs(5));
        clock.set_time(ClockTime::from_secs(1));
        assert_eq!(clock.now(), ClockTime::from_secs(5));
    }
}
