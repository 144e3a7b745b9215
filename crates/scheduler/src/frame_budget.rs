//! Time budget tracking
//!
//! The run loop enforces two budgets at once: the tick budget, which bounds
//! one host turn across every task it runs, and a task's own time quota,
//! which bounds one unbroken run of that task. Both are a [`Budget`]: a
//! start time plus an optional limit, checked against a [`Clock`] at each
//! exec-call boundary.

use crate::clock::Clock;
use std::time::Duration;

/// A span of time that started at a known instant and may run out.
///
/// A budget without a limit never runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Budget {
    /// When the budgeted span began
    started: Duration,

    /// How long the span may last
    limit: Option<Duration>,
}

impl Budget {
    /// Begin a budget now; a zero limit means no limit
    pub(crate) fn start(clock: &dyn Clock, limit: Option<Duration>) -> Self {
        Self {
            started: clock.now(),
            limit: limit.filter(|limit| !limit.is_zero()),
        }
    }

    /// Time spent since the span began
    pub(crate) fn elapsed(&self, clock: &dyn Clock) -> Duration {
        clock.now().saturating_sub(self.started)
    }

    /// Whether the limit has been reached
    pub(crate) fn is_exhausted(&self, clock: &dyn Clock) -> bool {
        self.limit
            .is_some_and(|limit| self.elapsed(clock) >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_budget_exhaustion() {
        let clock = ManualClock::new();
        let budget = Budget::start(&clock, Some(Duration::from_millis(5)));
        assert!(!budget.is_exhausted(&clock));

        clock.advance(Duration::from_millis(4));
        assert!(!budget.is_exhausted(&clock));

        // Reaching the limit exactly counts as exhausted
        clock.advance(Duration::from_millis(1));
        assert!(budget.is_exhausted(&clock));
    }

    #[test]
    fn test_elapsed_measured_from_start() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_millis(20));

        let budget = Budget::start(&clock, Some(Duration::from_micros(8_333)));
        clock.advance(Duration::from_millis(10));
        assert_eq!(budget.elapsed(&clock), Duration::from_millis(10));
        assert!(budget.is_exhausted(&clock));
    }

    #[test]
    fn test_zero_or_missing_limit_never_runs_out() {
        let clock = ManualClock::new();
        let zero = Budget::start(&clock, Some(Duration::ZERO));
        let none = Budget::start(&clock, None);

        clock.advance(Duration::from_secs(3600));
        assert!(!zero.is_exhausted(&clock));
        assert!(!none.is_exhausted(&clock));
    }
}
