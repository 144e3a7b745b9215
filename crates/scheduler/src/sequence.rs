//! Task sequences
//!
//! A [`TaskSequence`] chains task specs so that each stage's output becomes
//! the next stage's input. The next stage is created and started from
//! inside the previous stage's completion, as a continuation: it takes the
//! scheduler's current slot instead of queuing behind other work of the
//! same priority. Only strictly more urgent work can run between two
//! stages.
//!
//! A stage that pauses is resumed through [`TaskSequence::resume`]. Dropping
//! the sequence while a stage is paused ends it with [`TaskError::Dropped`].

use crate::error::{SchedulerError, TaskError};
use crate::scheduler::{TaskManager, WeakTaskManager};
use crate::task::{Sink, TaskCore, TaskHandle, TaskSpec, TaskState, Work};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tokio::sync::oneshot;

/// One stage of a sequence, with its concrete work type erased
trait Stage<T> {
    fn name(&self) -> &str;

    fn launch(
        self: Box<Self>,
        manager: &TaskManager,
        input: T,
        sink: Sink<T>,
        continuation: bool,
    ) -> Result<Rc<TaskCore>, SchedulerError>;
}

impl<T, W> Stage<T> for TaskSpec<W>
where
    T: 'static,
    W: Work<Input = T, Output = T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(
        self: Box<Self>,
        manager: &TaskManager,
        input: T,
        sink: Sink<T>,
        continuation: bool,
    ) -> Result<Rc<TaskCore>, SchedulerError> {
        let task = manager.create(*self)?;
        task.launch(input, sink, continuation)?;
        Ok(task.into_stage())
    }
}

type SequenceDone<T> = Box<dyn FnOnce(&[T])>;

struct SequenceState<T> {
    name: String,
    stages: VecDeque<Box<dyn Stage<T>>>,
    stage_count: usize,
    cursor: usize,
    results: Vec<T>,
    on_done: Option<SequenceDone<T>>,
    sender: Option<oneshot::Sender<Result<Vec<T>, TaskError>>>,
    state: TaskState,
    /// The stage launched last, while the sequence is in flight
    active: Option<Rc<TaskCore>>,
    /// The `TaskSequence` handle is gone
    detached: bool,
}

/// Builder for [`TaskSequence`]
pub struct TaskSequenceBuilder<T> {
    name: String,
    stages: Vec<Box<dyn Stage<T>>>,
    on_done: Option<SequenceDone<T>>,
}

impl<T: Clone + 'static> TaskSequenceBuilder<T> {
    /// Append a stage
    pub fn stage<W>(mut self, spec: TaskSpec<W>) -> Self
    where
        W: Work<Input = T, Output = T>,
    {
        self.stages.push(Box::new(spec));
        self
    }

    /// Callback run once with every stage's result, after the last stage
    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&[T]) + 'static,
    {
        self.on_done = Some(Box::new(f));
        self
    }

    /// Bind the sequence to a scheduler
    pub fn build(self, manager: &TaskManager) -> TaskSequence<T> {
        let stage_count = self.stages.len();
        TaskSequence {
            manager: manager.clone(),
            state: Rc::new(RefCell::new(SequenceState {
                name: self.name,
                stages: self.stages.into(),
                stage_count,
                cursor: 0,
                results: Vec::with_capacity(stage_count),
                on_done: self.on_done,
                sender: None,
                state: TaskState::Idle,
                active: None,
                detached: false,
            })),
        }
    }
}

/// Ordered chain of tasks run as one logical unit.
///
/// # Example
///
/// ```
/// use mapkit_scheduler::{EventLoop, ManualClock, SchedulerConfig, Step, TaskManager, TaskSequence, TaskSpec};
/// use std::rc::Rc;
///
/// let clock = Rc::new(ManualClock::new());
/// let host = EventLoop::new(clock.clone());
/// let manager = TaskManager::new(SchedulerConfig::default(), Rc::new(host.clone()), clock);
///
/// let double = |name: &'static str| {
///     TaskSpec::from_fns(name, |n: u64| Ok(n), |_: &mut u64| Ok(Step::Done), |n: u64| Ok(n * 2))
/// };
///
/// let sequence = TaskSequence::builder("double-twice")
///     .stage(double("first"))
///     .stage(double("second"))
///     .build(&manager);
///
/// let mut handle = sequence.start(5).unwrap();
/// host.run();
/// assert_eq!(handle.try_result().unwrap().unwrap(), vec![10, 20]);
/// ```
pub struct TaskSequence<T> {
    manager: TaskManager,
    state: Rc<RefCell<SequenceState<T>>>,
}

impl<T: Clone + 'static> TaskSequence<T> {
    /// Start describing a sequence
    pub fn builder(name: impl Into<String>) -> TaskSequenceBuilder<T> {
        TaskSequenceBuilder {
            name: name.into(),
            stages: Vec::new(),
            on_done: None,
        }
    }

    /// Sequence name
    pub fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    /// Number of stages
    pub fn stage_count(&self) -> usize {
        self.state.borrow().stage_count
    }

    /// Index of the active stage (equals the stage count once finished)
    pub fn cursor(&self) -> usize {
        self.state.borrow().cursor
    }

    /// Lifecycle of the sequence as a whole.
    ///
    /// `Queued` until the first stage is dispatched, `Paused` while the
    /// active stage is paused, `Running` otherwise until it settles.
    pub fn state(&self) -> TaskState {
        let seq = self.state.borrow();
        match (&seq.active, seq.state) {
            (Some(stage), TaskState::Queued | TaskState::Running) => match stage.state() {
                TaskState::Paused => TaskState::Paused,
                TaskState::Queued if seq.state == TaskState::Queued => TaskState::Queued,
                _ => TaskState::Running,
            },
            (_, state) => state,
        }
    }

    /// Resume the active stage after its `exec` paused it.
    ///
    /// # Errors
    /// [`SchedulerError::NotPaused`] if no stage is paused.
    pub fn resume(&self) -> Result<(), SchedulerError> {
        let active = self.state.borrow().active.clone();
        match active {
            Some(stage) => {
                self.manager.resume(&stage)?;
                self.state.borrow_mut().state = TaskState::Running;
                Ok(())
            }
            None => Err(SchedulerError::NotPaused {
                name: self.name(),
                state: self.state(),
            }),
        }
    }

    /// Create and start the first stage with `input`.
    ///
    /// The handle resolves with every stage's result in order, or with the
    /// error of the first stage that failed.
    ///
    /// # Errors
    /// [`SchedulerError::AlreadyStarted`] if the sequence was started before,
    /// or the first stage's creation error.
    pub fn start(&self, input: T) -> Result<TaskHandle<Vec<T>>, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut seq = self.state.borrow_mut();
            if seq.state != TaskState::Idle {
                return Err(SchedulerError::AlreadyStarted {
                    name: seq.name.clone(),
                    state: seq.state,
                });
            }
            seq.sender = Some(tx);
            seq.state = TaskState::Queued;
            seq.stages.pop_front()
        };

        let Some(first) = first else {
            tracing::debug!(sequence = %self.name(), "empty sequence finished immediately");
            finish(&self.state);
            return Ok(TaskHandle::new(rx));
        };

        let sink = stage_sink(self.state.clone(), self.manager.downgrade());
        match first.launch(&self.manager, input, sink, false) {
            Ok(stage) => {
                self.state.borrow_mut().active = Some(stage);
                Ok(TaskHandle::new(rx))
            }
            Err(error) => {
                let mut seq = self.state.borrow_mut();
                seq.state = TaskState::Failed;
                seq.sender = None;
                Err(error)
            }
        }
    }
}

impl<T> Drop for TaskSequence<T> {
    fn drop(&mut self) {
        let active = {
            let Ok(mut seq) = self.state.try_borrow_mut() else {
                return;
            };
            seq.detached = true;
            seq.active.take()
        };
        if let Some(stage) = active {
            self.manager.release(&stage);
        }
    }
}

/// Result sink of one stage: advance to the next stage or settle the sequence
fn stage_sink<T: Clone + 'static>(
    state: Rc<RefCell<SequenceState<T>>>,
    manager: WeakTaskManager,
) -> Sink<T> {
    Box::new(move |result| match result {
        Ok(output) => advance(state, manager, output),
        Err(error) => abort(&state, error),
    })
}

fn advance<T: Clone + 'static>(
    state: Rc<RefCell<SequenceState<T>>>,
    manager: WeakTaskManager,
    output: T,
) {
    let next = {
        let mut seq = state.borrow_mut();
        seq.results.push(output.clone());
        seq.cursor += 1;
        seq.state = TaskState::Running;
        seq.stages.pop_front()
    };

    let Some(next) = next else {
        finish(&state);
        return;
    };

    let Some(manager) = manager.upgrade() else {
        abort(&state, TaskError::Dropped);
        return;
    };

    tracing::debug!(
        sequence = %state.borrow().name,
        stage = next.name(),
        "starting next stage"
    );
    let sink = stage_sink(state.clone(), manager.downgrade());
    match next.launch(&manager, output, sink, true) {
        Ok(stage) => {
            let detached = {
                let mut seq = state.borrow_mut();
                seq.active = Some(stage.clone());
                seq.detached
            };
            if detached {
                state.borrow_mut().active = None;
                manager.release(&stage);
            }
        }
        Err(error) => abort(&state, error.into()),
    }
}

fn finish<T>(state: &Rc<RefCell<SequenceState<T>>>) {
    let (results, on_done, sender) = {
        let mut seq = state.borrow_mut();
        seq.state = TaskState::Done;
        seq.active = None;
        (
            std::mem::take(&mut seq.results),
            seq.on_done.take(),
            seq.sender.take(),
        )
    };

    if let Some(on_done) = on_done {
        on_done(&results);
    }
    if let Some(sender) = sender {
        // The caller may have dropped the handle
        let _ = sender.send(Ok(results));
    }
}

fn abort<T>(state: &Rc<RefCell<SequenceState<T>>>, error: TaskError) {
    let sender = {
        let mut seq = state.borrow_mut();
        seq.state = TaskState::Failed;
        seq.active = None;
        let dropped = seq.stages.len();
        seq.stages.clear();
        seq.results.clear();
        seq.on_done = None;
        tracing::warn!(sequence = %seq.name, remaining = dropped, %error, "sequence aborted");
        seq.sender.take()
    };

    if let Some(sender) = sender {
        let _ = sender.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SchedulerConfig;
    use crate::host::EventLoop;
    use crate::task::{FnWork, Step};

    fn setup() -> (TaskManager, EventLoop) {
        let clock = Rc::new(ManualClock::new());
        let host = EventLoop::new(clock.clone());
        let manager = TaskManager::new(SchedulerConfig::default(), Rc::new(host.clone()), clock);
        (manager, host)
    }

    fn append(name: &'static str, log: &Rc<RefCell<Vec<String>>>) -> TaskSpec<FnWork<String, String, String>> {
        let log = log.clone();
        TaskSpec::from_fns(
            name,
            |carry: String| Ok(carry),
            move |carry: &mut String| {
                log.borrow_mut().push(name.to_string());
                carry.push_str(name);
                Ok(Step::Done)
            },
            |carry: String| Ok(carry),
        )
    }

    #[test]
    fn test_results_thread_through_stages() {
        let (manager, host) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));

        let sequence = TaskSequence::builder("abc")
            .stage(append("a", &log))
            .stage(append("b", &log))
            .stage(append("c", &log))
            .build(&manager);
        assert_eq!(sequence.stage_count(), 3);
        assert_eq!(sequence.cursor(), 0);

        let mut handle = sequence.start(">".to_string()).unwrap();
        assert_eq!(sequence.state(), TaskState::Queued);
        host.run();

        assert_eq!(
            handle.try_result().unwrap().unwrap(),
            vec![">a".to_string(), ">ab".to_string(), ">abc".to_string()]
        );
        assert_eq!(sequence.cursor(), 3);
        assert_eq!(sequence.state(), TaskState::Done);
    }

    #[test]
    fn test_on_done_fires_once_with_all_results() {
        let (manager, host) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = seen.clone();
        let sequence = TaskSequence::builder("xy")
            .stage(append("x", &log))
            .stage(append("y", &log))
            .on_done(move |results: &[String]| s.borrow_mut().push(results.to_vec()))
            .build(&manager);

        sequence.start(String::new()).unwrap();
        host.run();

        assert_eq!(
            *seen.borrow(),
            vec![vec!["x".to_string(), "xy".to_string()]]
        );
    }

    #[test]
    fn test_start_twice_fails() {
        let (manager, host) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        let sequence = TaskSequence::builder("once")
            .stage(append("a", &log))
            .build(&manager);

        sequence.start(String::new()).unwrap();
        assert!(matches!(
            sequence.start(String::new()),
            Err(SchedulerError::AlreadyStarted { .. })
        ));
        host.run();
        assert_eq!(*log.borrow(), vec!["a"]);
    }

    #[test]
    fn test_failing_stage_aborts_the_rest() {
        let (manager, host) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));

        let failing = TaskSpec::from_fns(
            "failing",
            |carry: String| Ok(carry),
            |_: &mut String| -> anyhow::Result<Step> { anyhow::bail!("geometry invalid") },
            |carry: String| Ok(carry),
        );

        let sequence = TaskSequence::builder("broken")
            .stage(append("a", &log))
            .stage(failing)
            .stage(append("never", &log))
            .on_done(|_: &[String]| panic!("must not complete"))
            .build(&manager);

        let mut handle = sequence.start(String::new()).unwrap();
        host.run();

        let err = handle.try_result().unwrap().unwrap_err();
        assert_eq!(err.task_name(), Some("failing"));
        assert_eq!(*log.borrow(), vec!["a"]);
        assert_eq!(sequence.state(), TaskState::Failed);
        assert!(manager.is_idle());
    }

    #[test]
    fn test_invalid_stage_priority_rejects_sequence() {
        let (manager, host) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));

        let sequence = TaskSequence::builder("bad-priority")
            .stage(append("a", &log))
            .stage(append("b", &log).with_priority(99))
            .build(&manager);

        let mut handle = sequence.start(String::new()).unwrap();
        host.run();

        let err = handle.try_result().unwrap().unwrap_err();
        assert!(matches!(
            err,
            TaskError::Rejected(SchedulerError::InvalidPriority { priority: 99, .. })
        ));
    }

    #[test]
    fn test_empty_sequence_resolves_immediately() {
        let (manager, _host) = setup();
        let sequence: TaskSequence<u8> = TaskSequence::builder("empty").build(&manager);

        let mut handle = sequence.start(1).unwrap();
        assert_eq!(handle.try_result().unwrap().unwrap(), Vec::<u8>::new());
        assert_eq!(sequence.state(), TaskState::Done);
    }

    /// Stage that pauses on its first exec call and marks the carry
    fn parking(name: &'static str) -> TaskSpec<FnWork<String, String, String>> {
        TaskSpec::from_fns(
            name,
            |carry: String| Ok(carry),
            |carry: &mut String| {
                if carry.ends_with('~') {
                    return Ok(Step::Done);
                }
                carry.push('~');
                Ok(Step::Pause)
            },
            |carry: String| Ok(carry),
        )
    }

    #[test]
    fn test_paused_stage_resumes_through_sequence() {
        let (manager, host) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));

        let sequence = TaskSequence::builder("parked")
            .stage(parking("wait"))
            .stage(append("b", &log))
            .build(&manager);
        assert!(matches!(
            sequence.resume(),
            Err(SchedulerError::NotPaused { state: TaskState::Idle, .. })
        ));

        let mut handle = sequence.start(">".to_string()).unwrap();
        host.run();
        assert_eq!(sequence.state(), TaskState::Paused);
        assert!(handle.try_result().is_none());
        assert!(log.borrow().is_empty());

        sequence.resume().unwrap();
        assert_eq!(sequence.state(), TaskState::Running);
        host.run();

        assert_eq!(
            handle.try_result().unwrap().unwrap(),
            vec![">~".to_string(), ">~b".to_string()]
        );
        assert_eq!(sequence.state(), TaskState::Done);
    }

    #[test]
    fn test_dropping_sequence_with_paused_stage() {
        let (manager, host) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));

        let sequence = TaskSequence::builder("abandoned")
            .stage(append("a", &log))
            .stage(parking("wait"))
            .stage(append("never", &log))
            .build(&manager);
        let mut handle = sequence.start(String::new()).unwrap();
        host.run();
        assert_eq!(sequence.state(), TaskState::Paused);

        drop(sequence);
        assert!(matches!(handle.try_result(), Some(Err(TaskError::Dropped))));
        assert_eq!(*log.borrow(), vec!["a"]);
        assert!(manager.is_idle());
        assert_eq!(manager.stats().unfinished_tasks(), 0);
    }

    #[test]
    fn test_state_running_once_first_stage_dispatched() {
        let clock = ManualClock::new();
        let host = EventLoop::new(Rc::new(clock.clone()));
        let config = SchedulerConfig::default().with_tick_budget(std::time::Duration::from_millis(10));
        let manager = TaskManager::new(config, Rc::new(host.clone()), Rc::new(clock.clone()));

        let slow = TaskSpec::from_fns(
            "slow",
            |carry: String| Ok(carry),
            move |carry: &mut String| {
                clock.advance(std::time::Duration::from_millis(6));
                carry.push('.');
                Ok(if carry.len() >= 3 { Step::Done } else { Step::Continue })
            },
            |carry: String| Ok(carry),
        );
        let sequence = TaskSequence::builder("slow")
            .stage(slow)
            .build(&manager);

        let mut handle = sequence.start(String::new()).unwrap();
        assert_eq!(sequence.state(), TaskState::Queued);

        // Two exec calls exhaust the tick budget
        assert!(host.run_once());
        assert_eq!(sequence.cursor(), 0);
        assert_eq!(sequence.state(), TaskState::Running);

        host.run();
        assert_eq!(handle.try_result().unwrap().unwrap(), vec!["...".to_string()]);
        assert_eq!(sequence.state(), TaskState::Done);
    }

    #[test]
    fn test_continuation_not_overtaken_by_equal_priority() {
        let (manager, host) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));

        let sequence = TaskSequence::builder("chain")
            .stage(append("stage-1", &log).with_priority(2))
            .stage(append("stage-2", &log).with_priority(2))
            .build(&manager);
        sequence.start(String::new()).unwrap();

        let other = manager.create(append("other", &log).with_priority(2)).unwrap();
        other.start(String::new()).unwrap();

        host.run();
        assert_eq!(*log.borrow(), vec!["stage-1", "stage-2", "other"]);
    }
}
