//! Host event loops the scheduler yields to
//!
//! The run loop never blocks the host for longer than its budgets allow.
//! When it has to give control back it posts its own continuation through
//! [`Host::post`] and returns, so timers and other callbacks already queued
//! on the host get to run first.
//!
//! Two hosts are provided:
//! - [`EventLoop`]: a deterministic single-threaded macrotask queue with
//!   timers, driven by any [`Clock`]. Used for tests, scenario replay, and
//!   embedding in a frame-driven application.
//! - [`TokioHost`]: posts continuations onto the current tokio `LocalSet`
//!   after a `yield_now()`, so the tokio driver polls timers and I/O in
//!   between scheduler turns.

use crate::clock::Clock;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

/// A unit of host work.
pub type Continuation = Box<dyn FnOnce()>;

/// An event loop that accepts deferred work.
pub trait Host {
    /// Queue `job` to run on a later turn of the host loop, after callbacks
    /// that are already due.
    fn post(&self, job: Continuation);
}

/// Deterministic single-threaded event loop.
///
/// Callbacks are ordered by the time they became ready, then by the order
/// they were queued. A posted continuation becomes ready "now"; a timer
/// becomes ready at its deadline. A timer that fell due while the scheduler
/// was busy therefore runs before the scheduler's next continuation, which
/// is how a browser's task queue behaves.
///
/// # Example
///
/// ```
/// use mapkit_scheduler::{EventLoop, ManualClock};
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let event_loop = EventLoop::new(Rc::new(clock.clone()));
/// let log = Rc::new(RefCell::new(Vec::new()));
///
/// let l = log.clone();
/// event_loop.set_timeout(Duration::from_millis(5), move || l.borrow_mut().push("late"));
/// let l = log.clone();
/// event_loop.set_timeout(Duration::ZERO, move || l.borrow_mut().push("early"));
///
/// assert_eq!(event_loop.run(), 2);
/// assert_eq!(*log.borrow(), vec!["early", "late"]);
/// ```
#[derive(Clone)]
pub struct EventLoop {
    state: Rc<RefCell<LoopState>>,
    clock: Rc<dyn Clock>,
}

struct LoopState {
    /// Pending callbacks keyed by (ready time, queue order)
    queue: BTreeMap<(Duration, u64), Continuation>,

    /// Queue order counter (FIFO among callbacks ready at the same time)
    seq: u64,
}

impl EventLoop {
    /// Create an empty event loop reading time from `clock`
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            state: Rc::new(RefCell::new(LoopState {
                queue: BTreeMap::new(),
                seq: 0,
            })),
            clock,
        }
    }

    /// Run `job` once `delay` has elapsed.
    pub fn set_timeout<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + 'static,
    {
        let ready_at = self.clock.now() + delay;
        self.schedule_at(ready_at, Box::new(job));
    }

    /// Run a single callback, waiting on the clock if it is not due yet.
    ///
    /// Returns `false` if nothing was pending.
    pub fn run_once(&self) -> bool {
        let entry = {
            let mut state = self.state.borrow_mut();
            state.queue.pop_first()
        };

        let Some(((ready_at, _), job)) = entry else {
            return false;
        };

        if ready_at > self.clock.now() {
            self.clock.sleep_until(ready_at);
        }
        job();
        true
    }

    /// Run callbacks until the queue is empty.
    ///
    /// Returns the number of callbacks that ran.
    pub fn run(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        ran
    }

    /// Number of callbacks waiting to run
    pub fn pending(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Check if there is nothing left to run
    pub fn is_empty(&self) -> bool {
        self.state.borrow().queue.is_empty()
    }

    fn schedule_at(&self, ready_at: Duration, job: Continuation) {
        let mut state = self.state.borrow_mut();
        let seq = state.seq;
        state.seq += 1;
        state.queue.insert((ready_at, seq), job);
    }
}

impl Host for EventLoop {
    fn post(&self, job: Continuation) {
        let now = self.clock.now();
        self.schedule_at(now, job);
    }
}

/// Host backed by the tokio runtime.
///
/// Continuations are spawned with `tokio::task::spawn_local`, so the
/// scheduler must be driven from inside a `tokio::task::LocalSet`.
/// Posting outside a `LocalSet` panics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioHost;

impl Host for TokioHost {
    fn post(&self, job: Continuation) {
        tokio::task::spawn_local(async move {
            tokio::task::yield_now().await;
            job();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, ManualClock, EventLoop) {
        let clock = ManualClock::new();
        let event_loop = EventLoop::new(Rc::new(clock.clone()));
        (Rc::new(RefCell::new(Vec::new())), clock, event_loop)
    }

    #[test]
    fn test_posted_jobs_run_fifo() {
        let (log, _clock, event_loop) = recorder();

        for name in ["a", "b", "c"] {
            let log = log.clone();
            event_loop.post(Box::new(move || log.borrow_mut().push(name)));
        }

        assert_eq!(event_loop.pending(), 3);
        assert_eq!(event_loop.run(), 3);
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert!(event_loop.is_empty());
    }

    #[test]
    fn test_due_timer_runs_before_later_post() {
        let (log, clock, event_loop) = recorder();

        let l = log.clone();
        event_loop.set_timeout(Duration::from_millis(2), move || l.borrow_mut().push("timer"));

        // Something busy ran until 6ms and then posted its continuation
        clock.advance(Duration::from_millis(6));
        let l = log.clone();
        event_loop.post(Box::new(move || l.borrow_mut().push("continuation")));

        event_loop.run();
        assert_eq!(*log.borrow(), vec!["timer", "continuation"]);
    }

    #[test]
    fn test_run_once_advances_manual_clock_to_deadline() {
        let (_log, clock, event_loop) = recorder();
        event_loop.set_timeout(Duration::from_millis(15), || {});

        assert!(event_loop.run_once());
        assert_eq!(clock.now(), Duration::from_millis(15));
        assert!(!event_loop.run_once());
    }

    #[test]
    fn test_jobs_can_schedule_more_jobs() {
        let (log, _clock, event_loop) = recorder();

        let inner_loop = event_loop.clone();
        let l = log.clone();
        event_loop.post(Box::new(move || {
            l.borrow_mut().push("outer");
            let l = l.clone();
            inner_loop.post(Box::new(move || l.borrow_mut().push("inner")));
        }));

        assert_eq!(event_loop.run(), 2);
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }
}
