//! Tasks: units of cooperative work
//!
//! A task wraps three callbacks behind the [`Work`] trait:
//!
//! - `init(input)` builds the task's private data,
//! - `exec(&mut data)` does one atomic chunk of work and reports a [`Step`],
//! - `on_done(data)` turns the final data into the task's output.
//!
//! The scheduler only ever calls `exec` between suspension points, so a
//! chunk should be small enough to fit comfortably inside the tick budget.
//! `data` is owned by the task alone and is handed back untouched on every
//! call, including across yields and pause/resume.

use crate::error::{SchedulerError, TaskError};
use crate::scheduler::TaskManager;
use serde::Serialize;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// Unique task identifier within one scheduler
pub type TaskId = u64;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    /// Created, not started
    Idle,
    /// Waiting in its priority lane
    Queued,
    /// Inside the run loop
    Running,
    /// Gave control back because a budget ran out or it was preempted
    Yielded,
    /// Suspended by its own `exec`; out of all lanes until resumed
    Paused,
    /// Completed; `on_done` has run
    Done,
    /// A callback failed; the error went to the completion handle
    Failed,
}

impl TaskState {
    /// Whether the task will never run again
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

/// What a single `exec` call asks the scheduler to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More work remains; call `exec` again when budgets allow
    Continue,
    /// Suspend until [`Task::resume`] is called
    Pause,
    /// No more work; call `on_done` now
    Done,
}

/// The three callbacks of a task.
///
/// # Example
///
/// ```
/// use mapkit_scheduler::{Step, Work};
///
/// /// Sums a list a few items at a time
/// struct ChunkedSum {
///     chunk: usize,
/// }
///
/// impl Work for ChunkedSum {
///     type Input = Vec<u64>;
///     type Data = (Vec<u64>, u64);
///     type Output = u64;
///
///     fn init(&mut self, input: Vec<u64>) -> anyhow::Result<Self::Data> {
///         Ok((input, 0))
///     }
///
///     fn exec(&mut self, (items, sum): &mut Self::Data) -> anyhow::Result<Step> {
///         let take = self.chunk.min(items.len());
///         *sum += items.drain(..take).sum::<u64>();
///         Ok(if items.is_empty() { Step::Done } else { Step::Continue })
///     }
///
///     fn on_done(&mut self, (_, sum): Self::Data) -> anyhow::Result<u64> {
///         Ok(sum)
///     }
/// }
/// ```
pub trait Work: 'static {
    /// Value passed to `start`
    type Input: 'static;
    /// Private state threaded through `exec` calls
    type Data: 'static;
    /// Value the completion handle resolves with
    type Output: 'static;

    /// Build the task data. Called once, on the first dispatch.
    fn init(&mut self, input: Self::Input) -> anyhow::Result<Self::Data>;

    /// Do one chunk of work.
    fn exec(&mut self, data: &mut Self::Data) -> anyhow::Result<Step>;

    /// Produce the output. Called once, right after `exec` returns [`Step::Done`].
    fn on_done(&mut self, data: Self::Data) -> anyhow::Result<Self::Output>;
}

type InitFn<I, D> = Box<dyn FnMut(I) -> anyhow::Result<D>>;
type ExecFn<D> = Box<dyn FnMut(&mut D) -> anyhow::Result<Step>>;
type DoneFn<D, O> = Box<dyn FnMut(D) -> anyhow::Result<O>>;

/// [`Work`] built from three closures.
pub struct FnWork<I, D, O> {
    init: InitFn<I, D>,
    exec: ExecFn<D>,
    on_done: DoneFn<D, O>,
}

impl<I: 'static, D: 'static, O: 'static> Work for FnWork<I, D, O> {
    type Input = I;
    type Data = D;
    type Output = O;

    fn init(&mut self, input: I) -> anyhow::Result<D> {
        (self.init)(input)
    }

    fn exec(&mut self, data: &mut D) -> anyhow::Result<Step> {
        (self.exec)(data)
    }

    fn on_done(&mut self, data: D) -> anyhow::Result<O> {
        (self.on_done)(data)
    }
}

/// Everything needed to create a task: a name, scheduling metadata, and the work.
pub struct TaskSpec<W> {
    pub(crate) name: String,
    pub(crate) priority: u32,
    pub(crate) time_quota: Option<Duration>,
    pub(crate) work: W,
}

impl<W: Work> TaskSpec<W> {
    /// Spec at priority 0 with the scheduler's default time quota
    pub fn new(name: impl Into<String>, work: W) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            time_quota: None,
            work,
        }
    }

    /// Set the priority (higher is more urgent)
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the longest unbroken run before the task must yield
    pub fn with_time_quota(mut self, quota: Duration) -> Self {
        self.time_quota = Some(quota);
        self
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared priority
    pub fn priority(&self) -> u32 {
        self.priority
    }
}

impl<I: 'static, D: 'static, O: 'static> TaskSpec<FnWork<I, D, O>> {
    /// Spec from three closures
    ///
    /// ```
    /// use mapkit_scheduler::{Step, TaskSpec};
    ///
    /// let spec = TaskSpec::from_fns(
    ///     "count-to-three",
    ///     |start: u32| Ok(start),
    ///     |n: &mut u32| {
    ///         *n += 1;
    ///         Ok(if *n >= 3 { Step::Done } else { Step::Continue })
    ///     },
    ///     |n: u32| Ok(n),
    /// )
    /// .with_priority(2);
    ///
    /// assert_eq!(spec.name(), "count-to-three");
    /// assert_eq!(spec.priority(), 2);
    /// ```
    pub fn from_fns<FI, FE, FD>(name: impl Into<String>, init: FI, exec: FE, on_done: FD) -> Self
    where
        FI: FnMut(I) -> anyhow::Result<D> + 'static,
        FE: FnMut(&mut D) -> anyhow::Result<Step> + 'static,
        FD: FnMut(D) -> anyhow::Result<O> + 'static,
    {
        Self::new(
            name,
            FnWork {
                init: Box::new(init),
                exec: Box::new(exec),
                on_done: Box::new(on_done),
            },
        )
    }
}

/// Who can still resume a task after it pauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    /// Its [`Task`] handle is alive
    Handle,
    /// The sequence it is a stage of
    Sequence,
    /// Nobody; a pause ends the task with [`TaskError::Dropped`]
    Detached,
}

/// State shared between a [`Task`] handle and the scheduler
#[derive(Debug)]
pub(crate) struct TaskCore {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    priority: Cell<u32>,
    state: Cell<TaskState>,
    owner: Cell<Owner>,
}

impl TaskCore {
    pub(crate) fn new(id: TaskId, name: String, priority: u32) -> Self {
        Self {
            id,
            name,
            priority: Cell::new(priority),
            state: Cell::new(TaskState::Idle),
            owner: Cell::new(Owner::Handle),
        }
    }

    pub(crate) fn owner(&self) -> Owner {
        self.owner.get()
    }

    pub(crate) fn set_owner(&self, owner: Owner) {
        self.owner.set(owner);
    }

    pub(crate) fn priority(&self) -> u32 {
        self.priority.get()
    }

    pub(crate) fn set_priority(&self, priority: u32) {
        self.priority.set(priority);
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }
}

/// Receives a task's single result
pub(crate) type Sink<O> = Box<dyn FnOnce(Result<O, TaskError>)>;

/// Type-erased task body as seen by the run loop
pub(crate) trait Runnable {
    fn is_initialized(&self) -> bool;
    fn init(&mut self) -> anyhow::Result<()>;
    fn exec(&mut self) -> anyhow::Result<Step>;
    /// Run `on_done` and deliver the output
    fn finish(&mut self) -> anyhow::Result<()>;
    /// Deliver a failure
    fn fail(&mut self, error: TaskError);
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct Runner<W: Work> {
    work: W,
    input: Option<W::Input>,
    data: Option<W::Data>,
    sink: Option<Sink<W::Output>>,
}

impl<W: Work> Runner<W> {
    pub(crate) fn new(work: W) -> Self {
        Self {
            work,
            input: None,
            data: None,
            sink: None,
        }
    }

    pub(crate) fn arm(&mut self, input: W::Input, sink: Sink<W::Output>) {
        self.input = Some(input);
        self.sink = Some(sink);
    }
}

impl<W: Work> Runnable for Runner<W> {
    fn is_initialized(&self) -> bool {
        self.data.is_some()
    }

    fn init(&mut self) -> anyhow::Result<()> {
        let input = self
            .input
            .take()
            .ok_or_else(|| anyhow::anyhow!("task dispatched without input"))?;
        self.data = Some(self.work.init(input)?);
        Ok(())
    }

    fn exec(&mut self) -> anyhow::Result<Step> {
        let data = self
            .data
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("exec called before init"))?;
        self.work.exec(data)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        let data = self
            .data
            .take()
            .ok_or_else(|| anyhow::anyhow!("on_done called before init"))?;
        let output = self.work.on_done(data)?;
        if let Some(sink) = self.sink.take() {
            sink(Ok(output));
        }
        Ok(())
    }

    fn fail(&mut self, error: TaskError) {
        self.data = None;
        if let Some(sink) = self.sink.take() {
            sink(Err(error));
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Handle to a task created by [`TaskManager::create`].
///
/// Dropping the handle of a task that was never started discards it.
/// A started task keeps running without its handle; its result is
/// delivered through the [`TaskHandle`] returned by [`Task::start`].
/// Without a handle nothing can resume the task, so dropping the handle of
/// a paused task, or a task pausing after its handle is gone, ends it with
/// [`TaskError::Dropped`].
pub struct Task<W: Work> {
    pub(crate) core: Rc<TaskCore>,
    pub(crate) manager: TaskManager,
    pub(crate) _work: PhantomData<fn() -> W>,
}

impl<W: Work> Task<W> {
    /// Scheduler-assigned id
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current priority
    pub fn priority(&self) -> u32 {
        self.core.priority()
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Queue the task for execution.
    ///
    /// No callback runs synchronously: the task joins the tail of its lane
    /// and the run loop is armed on the host if it was idle.
    ///
    /// # Errors
    /// [`SchedulerError::AlreadyStarted`] if the task is not `Idle`.
    pub fn start(&self, input: W::Input) -> Result<TaskHandle<W::Output>, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.launch(
            input,
            Box::new(move |result| {
                // The caller may have dropped the handle; nothing to report then
                let _ = tx.send(result);
            }),
            false,
        )?;
        Ok(TaskHandle::new(rx))
    }

    /// Start with a custom result sink.
    ///
    /// A continuation takes the scheduler's current slot directly instead of
    /// joining its lane, so equal-priority work cannot slip in ahead of it.
    pub(crate) fn launch(
        &self,
        input: W::Input,
        sink: Sink<W::Output>,
        continuation: bool,
    ) -> Result<(), SchedulerError> {
        self.manager.install::<W>(&self.core, input, sink)?;
        self.manager.enqueue_started(&self.core, continuation);
        Ok(())
    }

    /// Hand the task over to a sequence, which resumes it from then on
    pub(crate) fn into_stage(self) -> Rc<TaskCore> {
        self.core.set_owner(Owner::Sequence);
        self.core.clone()
    }

    /// The value `exec` returns to suspend itself.
    ///
    /// # Errors
    /// [`SchedulerError::NotRunning`] unless called from inside this task's
    /// own `exec` callback.
    pub fn pause(&self) -> Result<Step, SchedulerError> {
        if self.manager.is_executing(self.core.id) {
            Ok(Step::Pause)
        } else {
            Err(SchedulerError::NotRunning {
                name: self.core.name.clone(),
            })
        }
    }

    /// Re-queue a paused task at the tail of its lane.
    ///
    /// `init` is not called again; the next `exec` sees the data exactly as
    /// the pausing `exec` left it.
    ///
    /// # Errors
    /// [`SchedulerError::NotPaused`] if the task is not `Paused`.
    pub fn resume(&self) -> Result<(), SchedulerError> {
        self.manager.resume(&self.core)
    }

    /// Change the priority.
    ///
    /// A task waiting in a lane moves to the tail of its new lane at once;
    /// a running task keeps running and the new value applies from the next
    /// dispatch decision.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidPriority`] if outside the scheduler's lanes.
    pub fn set_priority(&self, priority: u32) -> Result<(), SchedulerError> {
        self.manager.reprioritize(&self.core, priority)
    }
}

impl<W: Work> fmt::Debug for Task<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("priority", &self.core.priority())
            .field("state", &self.core.state())
            .finish()
    }
}

impl<W: Work> Drop for Task<W> {
    fn drop(&mut self) {
        if self.core.owner() == Owner::Handle {
            self.manager.release(&self.core);
        }
    }
}

/// Completion handle of a task or sequence.
///
/// Resolves exactly once, with the output of `on_done` or with the error
/// that stopped the task. Await it from async code, or poll it
/// synchronously with [`TaskHandle::try_result`].
#[derive(Debug)]
pub struct TaskHandle<O> {
    rx: oneshot::Receiver<Result<O, TaskError>>,
}

impl<O> TaskHandle<O> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<O, TaskError>>) -> Self {
        Self { rx }
    }

    /// Take the result if it is available.
    ///
    /// Returns `None` while the task is still pending. The result can be
    /// taken once; later calls report [`TaskError::Dropped`].
    pub fn try_result(&mut self) -> Option<Result<O, TaskError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TaskError::Dropped)),
        }
    }
}

impl<O> Future for TaskHandle<O> {
    type Output = Result<O, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Dropped)))
    }
}
