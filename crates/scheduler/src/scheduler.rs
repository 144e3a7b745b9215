//! Task manager and run loop
//!
//! [`TaskManager`] owns the priority lanes and the single run loop that
//! executes every task. Nothing runs outside the loop: `start` and `resume`
//! only queue work and arm the loop on the host.
//!
//! One host turn of the loop (a "tick"):
//!
//! 1. Pick the task to run: the task holding the current slot, unless a
//!    strictly more urgent task is ready, else the head of the most urgent
//!    non-empty lane. Nothing to pick means the loop goes idle.
//! 2. Call `init` if the task has not been initialized yet.
//! 3. Call `exec` repeatedly. After each `Continue` check, in order:
//!    the task's own time quota, the tick budget, and whether a strictly
//!    more urgent task became ready. The first that holds ends the turn.
//! 4. On `Done`, call `on_done` right away and pick the next task within the
//!    same turn, as long as the tick budget allows.
//!
//! A task that exhausts its quota or is preempted goes back to the tail of
//! its lane. A task that exhausts the tick budget keeps the current slot and
//! is resumed first on the next turn, so equal-priority work queued behind
//! it never overtakes it just because the host needed a turn.

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, TaskError};
use crate::frame_budget::Budget;
use crate::host::Host;
use crate::priority::Lanes;
use crate::task::{Owner, Runnable, Runner, Sink, Step, Task, TaskCore, TaskId, TaskSpec, TaskState, Work};
use serde::Serialize;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Tasks created
    pub tasks_created: u64,

    /// Tasks started
    pub tasks_started: u64,

    /// Tasks whose `on_done` ran successfully
    pub tasks_completed: u64,

    /// Tasks stopped by a callback error or panic
    pub tasks_failed: u64,

    /// Total `exec` calls
    pub execs: u64,

    /// Host turns the run loop has taken
    pub ticks: u64,

    /// Turns that ended because a budget ran out or work was preempted
    pub yields: u64,

    /// Times a task was set aside for a more urgent one
    pub preemptions: u64,

    /// Times a task paused itself
    pub pauses: u64,

    /// Tasks waiting in lanes or holding the current slot
    pub queue_size: usize,
}

impl SchedulerStats {
    /// Started tasks that have neither completed nor failed
    pub fn unfinished_tasks(&self) -> u64 {
        self.tasks_started - self.tasks_completed - self.tasks_failed
    }
}

/// Why a running task gave up control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum YieldReason {
    Quota,
    TickBudget,
    Preempted,
}

/// How a task's run within a tick ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    /// Done, failed, or paused: the loop may pick another task
    Released,
    /// The turn must end
    Yielded,
}

struct Slot {
    core: Rc<TaskCore>,
    time_quota: Option<Duration>,
    /// Taken out while a callback runs so no borrow is held across user code
    runner: Option<Box<dyn Runnable>>,
}

struct SchedulerState {
    config: SchedulerConfig,
    lanes: Lanes,
    tasks: HashMap<TaskId, Slot>,
    /// The running task, a tick-yielded task, or a sequence continuation
    current: Option<TaskId>,
    /// A continuation of the run loop is posted or running
    armed: bool,
    /// Task whose `exec` is on the stack right now
    executing: Option<TaskId>,
    next_task_id: TaskId,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn priority_of(&self, id: TaskId) -> Option<u32> {
        self.tasks.get(&id).map(|slot| slot.core.priority())
    }

    fn has_work(&self) -> bool {
        self.current.is_some() || !self.lanes.is_empty()
    }

    fn more_urgent_ready(&self, priority: u32) -> bool {
        self.lanes
            .peek_highest_non_empty()
            .is_some_and(|top| top > priority)
    }

    fn check_priority(&self, priority: u32) -> Result<(), SchedulerError> {
        if priority < self.config.max_priority_lanes {
            Ok(())
        } else {
            Err(SchedulerError::InvalidPriority {
                priority,
                max: self.config.max_priority_lanes,
            })
        }
    }
}

pub(crate) struct Shared {
    state: RefCell<SchedulerState>,
    host: Rc<dyn Host>,
    clock: Rc<dyn Clock>,
}

/// Cooperative, priority-preemptive, time-sliced task scheduler.
///
/// Cloning is cheap and yields another handle to the same scheduler. The
/// scheduler is single-threaded (`!Send`); callbacks may call back into it
/// freely (start or resume other tasks, create tasks, change priorities).
///
/// # Example
///
/// ```
/// use mapkit_scheduler::{EventLoop, ManualClock, SchedulerConfig, Step, TaskManager, TaskSpec};
/// use std::rc::Rc;
///
/// let clock = Rc::new(ManualClock::new());
/// let host = EventLoop::new(clock.clone());
/// let manager = TaskManager::new(SchedulerConfig::default(), Rc::new(host.clone()), clock);
///
/// let task = manager
///     .create(TaskSpec::from_fns(
///         "sum",
///         |items: Vec<u32>| Ok((items, 0u32)),
///         |(items, sum): &mut (Vec<u32>, u32)| {
///             *sum += items.pop().unwrap_or(0);
///             Ok(if items.is_empty() { Step::Done } else { Step::Continue })
///         },
///         |(_, sum): (Vec<u32>, u32)| Ok(sum),
///     ))
///     .unwrap();
///
/// let mut handle = task.start(vec![1, 2, 3]).unwrap();
/// assert!(handle.try_result().is_none());
///
/// host.run();
/// assert_eq!(handle.try_result().unwrap().unwrap(), 6);
/// ```
#[derive(Clone)]
pub struct TaskManager {
    shared: Rc<Shared>,
}

/// Non-owning reference to a [`TaskManager`]
#[derive(Clone)]
pub(crate) struct WeakTaskManager {
    shared: Weak<Shared>,
}

impl WeakTaskManager {
    pub(crate) fn upgrade(&self) -> Option<TaskManager> {
        self.shared.upgrade().map(|shared| TaskManager { shared })
    }
}

impl TaskManager {
    /// Create a scheduler that yields to `host` and measures time with `clock`
    pub fn new(config: SchedulerConfig, host: Rc<dyn Host>, clock: Rc<dyn Clock>) -> Self {
        config.warn_on_unsliced();
        tracing::debug!(
            lanes = config.max_priority_lanes,
            tick_budget_ms = config.tick_budget_ms,
            "task manager created"
        );
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(SchedulerState {
                    config,
                    lanes: Lanes::new(),
                    tasks: HashMap::new(),
                    current: None,
                    armed: false,
                    executing: None,
                    next_task_id: 1,
                    stats: SchedulerStats::default(),
                }),
                host,
                clock,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakTaskManager {
        WeakTaskManager {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// Create a task in the `Idle` state.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidPriority`] if the priority is outside this
    /// scheduler's lanes.
    pub fn create<W: Work>(&self, spec: TaskSpec<W>) -> Result<Task<W>, SchedulerError> {
        let mut state = self.shared.state.borrow_mut();
        state.check_priority(spec.priority)?;

        let time_quota = match spec.time_quota.or(state.config.default_time_quota()) {
            Some(quota) if quota.is_zero() => {
                tracing::warn!(task = %spec.name, "zero time quota: task is bounded by the tick budget only");
                None
            }
            quota => quota,
        };

        let id = state.next_task_id;
        state.next_task_id += 1;
        state.stats.tasks_created += 1;

        let core = Rc::new(TaskCore::new(id, spec.name, spec.priority));
        state.tasks.insert(
            id,
            Slot {
                core: core.clone(),
                time_quota,
                runner: Some(Box::new(Runner::new(spec.work))),
            },
        );
        tracing::trace!(task = %core.name, id, priority = core.priority(), "task created");

        Ok(Task {
            core,
            manager: self.clone(),
            _work: PhantomData,
        })
    }

    /// The configuration this scheduler was built with
    pub fn config(&self) -> SchedulerConfig {
        self.shared.state.borrow().config.clone()
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.state.borrow();
        let mut stats = state.stats.clone();
        stats.queue_size = state.lanes.len() + usize::from(state.current.is_some());
        stats
    }

    /// Check if there is no runnable work and no run loop continuation posted
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.borrow();
        !state.armed && !state.has_work()
    }

    /// Ids of queued tasks in the order they would be dispatched
    pub fn queued_tasks(&self) -> Vec<TaskId> {
        let state = self.shared.state.borrow();
        state.current.into_iter().chain(state.lanes.dispatch_order()).collect()
    }

    // Task lifecycle, called through `Task`

    pub(crate) fn install<W: Work>(
        &self,
        core: &TaskCore,
        input: W::Input,
        sink: Sink<W::Output>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.shared.state.borrow_mut();
        if core.state() != TaskState::Idle {
            return Err(SchedulerError::AlreadyStarted {
                name: core.name.clone(),
                state: core.state(),
            });
        }

        let runner = state
            .tasks
            .get_mut(&core.id)
            .and_then(|slot| slot.runner.as_mut())
            .and_then(|runner| {
                let any: &mut dyn Any = runner.as_any_mut();
                any.downcast_mut::<Runner<W>>()
            })
            .ok_or(SchedulerError::UnknownTask(core.id))?;
        runner.arm(input, sink);
        Ok(())
    }

    pub(crate) fn enqueue_started(&self, core: &TaskCore, continuation: bool) {
        {
            let mut state = self.shared.state.borrow_mut();
            core.set_state(TaskState::Queued);
            state.stats.tasks_started += 1;

            if continuation && state.current.is_none() {
                tracing::debug!(task = %core.name, "dispatching continuation");
                state.current = Some(core.id);
            } else {
                state.lanes.enqueue(core.priority(), core.id);
            }
        }
        self.arm();
    }

    pub(crate) fn resume(&self, core: &TaskCore) -> Result<(), SchedulerError> {
        {
            let mut state = self.shared.state.borrow_mut();
            if core.state() != TaskState::Paused {
                return Err(SchedulerError::NotPaused {
                    name: core.name.clone(),
                    state: core.state(),
                });
            }
            core.set_state(TaskState::Queued);
            state.lanes.enqueue(core.priority(), core.id);
            tracing::debug!(task = %core.name, "task resumed");
        }
        self.arm();
        Ok(())
    }

    pub(crate) fn reprioritize(&self, core: &TaskCore, priority: u32) -> Result<(), SchedulerError> {
        let mut state = self.shared.state.borrow_mut();
        state.check_priority(priority)?;

        let old = core.priority();
        core.set_priority(priority);

        let queued = matches!(core.state(), TaskState::Queued | TaskState::Yielded);
        if queued && old != priority && state.current != Some(core.id) && state.lanes.remove(old, core.id) {
            state.lanes.enqueue(priority, core.id);
            tracing::debug!(task = %core.name, from = old, to = priority, "task re-bucketed");
        }
        Ok(())
    }

    pub(crate) fn is_executing(&self, id: TaskId) -> bool {
        self.shared.state.borrow().executing == Some(id)
    }

    /// The last party able to resume `core` let go of it.
    ///
    /// An idle task is discarded and a paused one fails with
    /// [`TaskError::Dropped`]. Anything else keeps running, detached.
    pub(crate) fn release(&self, core: &Rc<TaskCore>) {
        core.set_owner(Owner::Detached);

        // A drop during unwinding may find the state borrowed; skip then
        let paused = {
            let Ok(mut state) = self.shared.state.try_borrow_mut() else {
                return;
            };
            match core.state() {
                TaskState::Idle => {
                    state.tasks.remove(&core.id);
                    None
                }
                TaskState::Paused => state
                    .tasks
                    .get_mut(&core.id)
                    .and_then(|slot| slot.runner.take()),
                _ => None,
            }
        };

        if let Some(runner) = paused {
            tracing::debug!(task = %core.name, "paused task released");
            self.fail(core, runner, TaskError::Dropped);
        }
    }

    // Run loop

    fn arm(&self) {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.armed {
                return;
            }
            state.armed = true;
        }
        self.post_continuation();
    }

    fn post_continuation(&self) {
        let weak = self.downgrade();
        self.shared.host.post(Box::new(move || {
            if let Some(manager) = weak.upgrade() {
                manager.run_tick();
            }
        }));
    }

    fn clock(&self) -> &dyn Clock {
        self.shared.clock.as_ref()
    }

    /// One host turn of the run loop
    fn run_tick(&self) {
        let tick = {
            let mut state = self.shared.state.borrow_mut();
            state.stats.ticks += 1;
            Budget::start(self.clock(), state.config.tick_budget())
        };

        loop {
            let Some(id) = self.select() else {
                self.shared.state.borrow_mut().armed = false;
                tracing::trace!("run loop idle");
                return;
            };

            match self.run_task(id, &tick) {
                RunOutcome::Yielded => {
                    self.post_continuation();
                    return;
                }
                RunOutcome::Released => {
                    let has_work = self.shared.state.borrow().has_work();
                    if has_work && tick.is_exhausted(self.clock()) {
                        self.shared.state.borrow_mut().stats.yields += 1;
                        tracing::debug!("tick budget exhausted between tasks");
                        self.post_continuation();
                        return;
                    }
                }
            }
        }
    }

    /// Decide which task runs next and give it the current slot
    fn select(&self) -> Option<TaskId> {
        let mut guard = self.shared.state.borrow_mut();
        let state = &mut *guard;

        if let Some(id) = state.current {
            match state.priority_of(id) {
                Some(priority) if state.more_urgent_ready(priority) => {
                    // Keep its place ahead of equal-priority work
                    state.current = None;
                    state.lanes.enqueue_front(priority, id);
                    state.stats.preemptions += 1;
                    tracing::debug!(id, priority, "current task displaced by more urgent work");
                }
                Some(_) => return Some(id),
                None => state.current = None,
            }
        }

        let (_, id) = state.lanes.dequeue_highest()?;
        state.current = Some(id);
        Some(id)
    }

    /// Run one task until it finishes, pauses, or has to yield
    fn run_task(&self, id: TaskId, tick: &Budget) -> RunOutcome {
        let taken = {
            let mut state = self.shared.state.borrow_mut();
            state.tasks.get_mut(&id).and_then(|slot| {
                let runner = slot.runner.take()?;
                Some((runner, slot.core.clone(), slot.time_quota))
            })
        };
        let Some((mut runner, core, time_quota)) = taken else {
            // Lost its slot; nothing left to run
            let mut state = self.shared.state.borrow_mut();
            if state.current == Some(id) {
                state.current = None;
            }
            return RunOutcome::Released;
        };

        core.set_state(TaskState::Running);
        let quota = Budget::start(self.clock(), time_quota);
        tracing::trace!(task = %core.name, "task running");

        if !runner.is_initialized() {
            if let Err(error) = guard(&core, || runner.init()) {
                self.fail(&core, runner, error);
                return RunOutcome::Released;
            }
        }

        loop {
            self.shared.state.borrow_mut().executing = Some(id);
            let step = guard(&core, || runner.exec());
            {
                let mut state = self.shared.state.borrow_mut();
                state.executing = None;
                state.stats.execs += 1;
            }

            match step {
                Err(error) => {
                    self.fail(&core, runner, error);
                    return RunOutcome::Released;
                }
                Ok(Step::Pause) if core.owner() == Owner::Detached => {
                    tracing::debug!(task = %core.name, "nothing left to resume the task");
                    self.fail(&core, runner, TaskError::Dropped);
                    return RunOutcome::Released;
                }
                Ok(Step::Pause) => {
                    let mut state = self.shared.state.borrow_mut();
                    core.set_state(TaskState::Paused);
                    state.current = None;
                    state.stats.pauses += 1;
                    restore(&mut state, id, runner);
                    tracing::debug!(task = %core.name, "task paused");
                    return RunOutcome::Released;
                }
                Ok(Step::Done) => {
                    self.complete(&core, runner);
                    return RunOutcome::Released;
                }
                Ok(Step::Continue) => {
                    let Some(reason) = self.yield_reason(&core, &quota, tick) else {
                        continue;
                    };

                    let mut state = self.shared.state.borrow_mut();
                    core.set_state(TaskState::Yielded);
                    state.stats.yields += 1;
                    match reason {
                        YieldReason::TickBudget => {}
                        YieldReason::Quota | YieldReason::Preempted => {
                            if reason == YieldReason::Preempted {
                                state.stats.preemptions += 1;
                            }
                            state.current = None;
                            state.lanes.enqueue(core.priority(), id);
                        }
                    }
                    restore(&mut state, id, runner);
                    tracing::debug!(task = %core.name, ?reason, "task yielded");
                    return RunOutcome::Yielded;
                }
            }
        }
    }

    fn yield_reason(
        &self,
        core: &TaskCore,
        quota: &Budget,
        tick: &Budget,
    ) -> Option<YieldReason> {
        if quota.is_exhausted(self.clock()) {
            return Some(YieldReason::Quota);
        }
        if tick.is_exhausted(self.clock()) {
            return Some(YieldReason::TickBudget);
        }
        if self.shared.state.borrow().more_urgent_ready(core.priority()) {
            return Some(YieldReason::Preempted);
        }
        None
    }

    /// Run `on_done` for a task whose `exec` reported `Done`
    fn complete(&self, core: &Rc<TaskCore>, mut runner: Box<dyn Runnable>) {
        {
            // Free the current slot first: `on_done` may dispatch a continuation
            let mut state = self.shared.state.borrow_mut();
            core.set_state(TaskState::Done);
            state.current = None;
        }

        match guard(core, || runner.finish()) {
            Ok(()) => {
                let mut state = self.shared.state.borrow_mut();
                state.tasks.remove(&core.id);
                state.stats.tasks_completed += 1;
                tracing::trace!(task = %core.name, "task done");
            }
            Err(error) => self.fail(core, runner, error),
        }
    }

    /// Abort a task and deliver its error
    fn fail(&self, core: &Rc<TaskCore>, mut runner: Box<dyn Runnable>, error: TaskError) {
        {
            let mut state = self.shared.state.borrow_mut();
            core.set_state(TaskState::Failed);
            if state.current == Some(core.id) {
                state.current = None;
            }
            state.tasks.remove(&core.id);
            state.stats.tasks_failed += 1;
        }
        tracing::warn!(task = %core.name, %error, "task failed");
        runner.fail(error);
    }
}

/// Put a runner back into its slot
fn restore(state: &mut SchedulerState, id: TaskId, runner: Box<dyn Runnable>) {
    if let Some(slot) = state.tasks.get_mut(&id) {
        slot.runner = Some(runner);
    }
}

/// Run a user callback, turning errors and panics into a [`TaskError`]
fn guard<T>(core: &TaskCore, f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, TaskError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(TaskError::Failed {
            task: core.name.clone(),
            source,
        }),
        Err(payload) => Err(TaskError::Panicked {
            task: core.name.clone(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
