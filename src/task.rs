//! Tasks: suspendable units of work tracked by an [`EventLoop`].
//!
//! A task body is a future returning `Result<T, TaskFailure>`. Each poll is
//! one resumption; returning `Poll::Pending` suspends the task until whatever
//! it waits on wakes it, and returning `Poll::Ready` moves it to a terminal
//! state. Completion is published once to every registered waiter, in the
//! order they registered.
//!
//! [`EventLoop`]: crate::executor::EventLoop

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::context;
use crate::error::{CancelOutcome, Error, TaskFailure};
use crate::executor::Core;
use crate::sync::MutexId;
use crate::time::Instant;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned, never resumed.
    Pending,
    Running,
    Suspended,
    Finished,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// What a suspended task waits on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    Timer(Instant),
    TaskCompletion(TaskId),
    LockAcquire(MutexId),
    /// Gave up the rest of the drain cycle with `yield_now`.
    Yield,
}

/// Terminal result of a task. Cancellation is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Finished(T),
    Failed(TaskFailure),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_finished(&self) -> bool {
        matches!(self, Outcome::Finished(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Outcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Outcome::Finished(value) => Ok(value),
            Outcome::Failed(failure) => Err(Error::Failed(failure)),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }

    fn state(&self) -> TaskState {
        match self {
            Outcome::Finished(_) => TaskState::Finished,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Cancelled => TaskState::Cancelled,
        }
    }
}

pub(crate) enum Waiter {
    Wake(Waker),
    Call(Box<dyn FnOnce()>),
}

/// Type-erased part of a task shared with the loop's registry.
pub(crate) struct Header {
    id: TaskId,
    state: Cell<TaskState>,
    wait: Cell<Option<WaitCondition>>,
    waiters: RefCell<Vec<(u64, Waiter)>>,
    next_waiter: Cell<u64>,
}

impl Header {
    fn new(id: TaskId) -> Self {
        Self {
            id,
            state: Cell::new(TaskState::Pending),
            wait: Cell::new(None),
            waiters: RefCell::new(Vec::new()),
            next_waiter: Cell::new(0),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        debug_assert!(!self.state.get().is_terminal());
        self.state.set(state);
    }

    pub(crate) fn wait(&self) -> Option<WaitCondition> {
        self.wait.get()
    }

    pub(crate) fn set_wait(&self, wait: Option<WaitCondition>) {
        self.wait.set(wait);
    }

    fn add_waiter(&self, waiter: Waiter) -> u64 {
        let key = self.next_waiter.get();
        self.next_waiter.set(key + 1);
        self.waiters.borrow_mut().push((key, waiter));
        key
    }

    fn update_waker(&self, key: u64, waker: &Waker) {
        for (k, waiter) in self.waiters.borrow_mut().iter_mut() {
            if *k == key {
                if let Waiter::Wake(current) = waiter {
                    if !current.will_wake(waker) {
                        *current = waker.clone();
                    }
                }
            }
        }
    }

    fn remove_waiter(&self, key: u64) {
        let removed = {
            let mut waiters = self.waiters.borrow_mut();
            waiters
                .iter()
                .position(|(k, _)| *k == key)
                .map(|pos| waiters.remove(pos))
        };
        drop(removed);
    }

    /// Hands out the waiters once the task is terminal.
    pub(crate) fn take_waiters(&self) -> Vec<Waiter> {
        debug_assert!(self.state.get().is_terminal());
        let waiters = core::mem::take(&mut *self.waiters.borrow_mut());
        waiters.into_iter().map(|(_, waiter)| waiter).collect()
    }
}

/// Loop-side view of a task.
pub(crate) trait Settle {
    fn header(&self) -> &Header;

    fn settle_cancelled(&self);
}

pub(crate) struct TaskCell<T> {
    header: Header,
    outcome: RefCell<Option<Outcome<T>>>,
}

impl<T> TaskCell<T> {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            header: Header::new(id),
            outcome: RefCell::new(None),
        }
    }

    /// Stores the outcome first so a terminal state always has one.
    pub(crate) fn settle(&self, outcome: Outcome<T>) {
        let state = outcome.state();
        *self.outcome.borrow_mut() = Some(outcome);
        self.header.set_wait(None);
        self.header.set_state(state);
    }
}

impl<T> Settle for TaskCell<T> {
    fn header(&self) -> &Header {
        &self.header
    }

    fn settle_cancelled(&self) {
        self.settle(Outcome::Cancelled);
    }
}

/// Shared handle to a spawned task.
pub struct TaskHandle<T> {
    cell: Rc<TaskCell<T>>,
    core: Weak<Core>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            core: self.core.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(cell: Rc<TaskCell<T>>, core: Weak<Core>) -> Self {
        Self { cell, core }
    }

    pub fn id(&self) -> TaskId {
        self.cell.header.id
    }

    pub fn state(&self) -> TaskState {
        self.cell.header.state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// What the task is suspended on, if it is suspended on something the loop knows about.
    pub fn wait_condition(&self) -> Option<WaitCondition> {
        match self.state() {
            TaskState::Suspended => self.cell.header.wait(),
            _ => None,
        }
    }

    /// Cancels a pending or suspended task.
    ///
    /// The task's future is dropped, which unregisters it from its timer, lock
    /// queue or awaited task, and releases any lock guard it holds. Tasks
    /// waiting on it observe [`Outcome::Cancelled`].
    pub fn cancel(&self) -> Result<CancelOutcome, Error> {
        if self.is_done() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        match self.core.upgrade() {
            Some(core) => core.cancel(self.id()),
            None => Err(Error::LoopClosed),
        }
    }

    /// Awaits the task from another task.
    pub fn join(&self) -> Join<T> {
        Join {
            cell: self.cell.clone(),
            waiter: None,
        }
    }
}

impl<T: 'static> TaskHandle<T> {
    /// Runs `callback` with the outcome once the task is terminal.
    ///
    /// The callback is scheduled as a soon-callback, right away if the task
    /// is already done.
    pub fn add_done_callback<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnOnce(&Outcome<T>) + 'static,
    {
        let cell = self.cell.clone();
        let call = Box::new(move || {
            if let Some(outcome) = cell.outcome.borrow().as_ref() {
                callback(outcome);
            }
        });

        if self.is_done() {
            let core = self.core.upgrade().ok_or(Error::LoopClosed)?;
            core.schedule_call(call)?;
        } else {
            self.cell.header.add_waiter(Waiter::Call(call));
        }
        Ok(())
    }
}

impl<T: Clone + 'static> TaskHandle<T> {
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.cell.outcome.borrow().clone()
    }

    /// The task's value, or why there is none.
    pub fn result(&self) -> Result<T, Error> {
        self.outcome().ok_or(Error::NotFinished)?.into_result()
    }
}

/// Future returned by [`TaskHandle::join`].
#[must_use = "futures do nothing unless polled"]
pub struct Join<T> {
    cell: Rc<TaskCell<T>>,
    waiter: Option<u64>,
}

impl<T> Join<T> {
    pub fn task_id(&self) -> TaskId {
        self.cell.header.id
    }
}

impl<T: Clone> Future for Join<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        let header = &this.cell.header;

        if header.state().is_terminal() {
            this.waiter = None;
            if let Some(outcome) = this.cell.outcome.borrow().as_ref() {
                return Poll::Ready(outcome.clone());
            }
        }

        match this.waiter {
            Some(key) => header.update_waker(key, cx.waker()),
            None => this.waiter = Some(header.add_waiter(Waiter::Wake(cx.waker().clone()))),
        }
        context::set_wait(WaitCondition::TaskCompletion(header.id));
        Poll::Pending
    }
}

impl<T> Drop for Join<T> {
    fn drop(&mut self) {
        if let Some(key) = self.waiter.take() {
            if !self.cell.header.state().is_terminal() {
                self.cell.header.remove_waiter(key);
            }
        }
    }
}
