//! Error types
//!
//! [`SchedulerError`] reports caller bugs: misuse of the task lifecycle or
//! invalid configuration of a single task. It fails the offending call and
//! leaves the scheduler untouched.
//!
//! [`TaskError`] is what a completion handle resolves to when a task (or a
//! sequence stage) did not finish normally.

use crate::task::{TaskId, TaskState};

/// Misuse of the scheduler API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("task '{name}' was already started (state: {state:?})")]
    AlreadyStarted { name: String, state: TaskState },

    #[error("task '{name}' cannot be resumed: it is {state:?}, not Paused")]
    NotPaused { name: String, state: TaskState },

    #[error("task '{name}' can only pause from inside its own exec call")]
    NotRunning { name: String },

    #[error("priority {priority} is out of range: this scheduler has {max} lanes")]
    InvalidPriority { priority: u32, max: u32 },

    #[error("task {0} is not known to this scheduler")]
    UnknownTask(TaskId),
}

/// Reason a task or sequence did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// A callback returned an error
    #[error("task '{task}' failed: {source}")]
    Failed {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// A callback panicked
    #[error("task '{task}' panicked: {message}")]
    Panicked { task: String, message: String },

    /// A sequence could not launch its next stage
    #[error(transparent)]
    Rejected(#[from] SchedulerError),

    /// The scheduler, or the only handle able to resume the task, went away
    /// before the task completed
    #[error("task was dropped before it completed")]
    Dropped,
}

impl TaskError {
    /// Name of the task that failed, when known
    pub fn task_name(&self) -> Option<&str> {
        match self {
            TaskError::Failed { task, .. } | TaskError::Panicked { task, .. } => Some(task),
            TaskError::Rejected(_) | TaskError::Dropped => None,
        }
    }
}
