use std::rc::Rc;

use crate::time::Duration;

/// Errors reported by the event loop and its primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("delay must not be negative, got {0}")]
    InvalidDelay(Duration),
    #[error("event loop is closed")]
    LoopClosed,
    #[error("cannot close a running event loop")]
    LoopNotStopped,
    #[error("event loop is already running")]
    AlreadyRunning,
    /// Nothing is ready, no timer is pending and the awaited task is unfinished.
    #[error("event loop stalled: no ready work and no pending timers")]
    Deadlock,
    #[error("event loop stopped before the task completed")]
    StoppedBeforeComplete,
    #[error("lock released by a task that does not own it")]
    NotOwner,
    #[error("task has not finished yet")]
    NotFinished,
    #[error("task was cancelled")]
    Cancelled,
    #[error("task failed: {0}")]
    Failed(TaskFailure),
    /// A task tried to cancel itself from its own body.
    #[error("cannot cancel a running task")]
    TaskRunning,
    #[error("not called from within a task")]
    NoCurrentTask,
    #[error("timed out")]
    Timeout,
}

/// Error value produced by a task body.
///
/// Cheap to clone: a finished task's outcome is shared by every handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskFailure {
    #[error("{0}")]
    Raised(Rc<str>),
    #[error(transparent)]
    Scheduler(Box<Error>),
}

impl TaskFailure {
    pub fn new(message: impl Into<Rc<str>>) -> Self {
        TaskFailure::Raised(message.into())
    }
}

impl From<Error> for TaskFailure {
    fn from(err: Error) -> Self {
        TaskFailure::Scheduler(Box::new(err))
    }
}

/// What [`TaskHandle::cancel`](crate::task::TaskHandle::cancel) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The task had already finished, failed or been cancelled. Nothing changed.
    AlreadyTerminal,
}
