//! Shared schedulers keyed by lane capacity
//!
//! Work producers that should share one run loop ask the registry for the
//! scheduler with the lane capacity they need instead of reaching for a
//! global. The registry is built once by the host application and passed
//! by reference to everything that submits work.

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::host::Host;
use crate::scheduler::TaskManager;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Factory handing out one [`TaskManager`] per lane capacity.
///
/// # Example
///
/// ```
/// use mapkit_scheduler::{EventLoop, ManualClock, SchedulerConfig, SchedulerRegistry};
/// use std::rc::Rc;
///
/// let clock = Rc::new(ManualClock::new());
/// let host = Rc::new(EventLoop::new(clock.clone()));
/// let registry = SchedulerRegistry::new(SchedulerConfig::default(), host, clock);
///
/// let tiles = registry.get_or_create(Some(4));
/// let styles = registry.get_or_create(Some(4));
/// assert_eq!(tiles.config().max_priority_lanes, 4);
/// assert_eq!(registry.len(), 1);
/// # drop((tiles, styles));
/// ```
pub struct SchedulerRegistry {
    base: SchedulerConfig,
    host: Rc<dyn Host>,
    clock: Rc<dyn Clock>,
    managers: RefCell<HashMap<u32, TaskManager>>,
}

impl SchedulerRegistry {
    /// Create a registry; `base` supplies every setting except lane capacity
    pub fn new(base: SchedulerConfig, host: Rc<dyn Host>, clock: Rc<dyn Clock>) -> Self {
        Self {
            base,
            host,
            clock,
            managers: RefCell::new(HashMap::new()),
        }
    }

    /// The scheduler with `max_priority_lanes` lanes, created on first use.
    ///
    /// `None` selects the base configuration's capacity.
    pub fn get_or_create(&self, max_priority_lanes: Option<u32>) -> TaskManager {
        let lanes = max_priority_lanes.unwrap_or(self.base.max_priority_lanes);
        self.managers
            .borrow_mut()
            .entry(lanes)
            .or_insert_with(|| {
                tracing::debug!(lanes, "creating shared scheduler");
                TaskManager::new(
                    self.base.clone().with_max_priority_lanes(lanes),
                    self.host.clone(),
                    self.clock.clone(),
                )
            })
            .clone()
    }

    /// Number of schedulers created so far
    pub fn len(&self) -> usize {
        self.managers.borrow().len()
    }

    /// Check if no scheduler has been created yet
    pub fn is_empty(&self) -> bool {
        self.managers.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::EventLoop;
    use crate::task::{Step, TaskSpec};
    use std::time::Duration;

    fn registry() -> (SchedulerRegistry, EventLoop) {
        let clock = Rc::new(ManualClock::new());
        let host = EventLoop::new(clock.clone());
        let base = SchedulerConfig::default().with_tick_budget(Duration::from_millis(16));
        (SchedulerRegistry::new(base, Rc::new(host.clone()), clock), host)
    }

    #[test]
    fn test_same_capacity_shares_scheduler() {
        let (registry, host) = registry();
        assert!(registry.is_empty());

        let a = registry.get_or_create(Some(3));
        let b = registry.get_or_create(Some(3));

        let task = a
            .create(TaskSpec::from_fns("t", |_: ()| Ok(()), |_: &mut ()| Ok(Step::Done), |_: ()| Ok(())))
            .unwrap();
        task.start(()).unwrap();

        // Both handles see the same queue
        assert_eq!(b.stats().queue_size, 1);
        host.run();
        assert_eq!(b.stats().tasks_completed, 1);
    }

    #[test]
    fn test_distinct_capacities_get_distinct_schedulers() {
        let (registry, _host) = registry();

        let small = registry.get_or_create(Some(2));
        let default = registry.get_or_create(None);

        assert_eq!(registry.len(), 2);
        assert_eq!(small.config().max_priority_lanes, 2);
        assert_eq!(default.config().max_priority_lanes, 10);
        assert_eq!(default.config().tick_budget_ms, 16);
    }
}
