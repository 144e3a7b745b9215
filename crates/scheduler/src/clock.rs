//! Time sources for budget enforcement
//!
//! Every quota and tick-budget decision the run loop makes goes through a
//! [`Clock`]. Production hosts use [`SystemClock`]; deterministic tests and
//! scenario replay use [`ManualClock`], where "work" is simulated by
//! advancing virtual time explicitly.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic time source measured from an arbitrary origin.
pub trait Clock {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    /// Block until `deadline` (measured from the origin) has been reached.
    ///
    /// Used by [`crate::EventLoop`] when the next pending callback is a
    /// timer that is not due yet.
    fn sleep_until(&self, deadline: Duration);
}

/// Wall-clock time source backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep_until(&self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// Virtual time source advanced by hand.
///
/// Clones share the same underlying time, so a task body can hold one
/// clone and "spend" time while the scheduler reads another.
///
/// # Example
///
/// ```
/// use mapkit_scheduler::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let observer = clock.clone();
///
/// clock.advance(Duration::from_millis(6));
/// assert_eq!(observer.now(), Duration::from_millis(6));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `delta`
    pub fn advance(&self, delta: Duration) {
        self.now.set(self.now.get() + delta);
    }

    /// Jump to an absolute time; never moves backwards
    pub fn set(&self, at: Duration) {
        if at > self.now.get() {
            self.now.set(at);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep_until(&self, deadline: Duration) {
        self.set(deadline);
    }
}
