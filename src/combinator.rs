//! Futures that wait on several tasks at once.
//!
//! None of them cancels a task on its own, except [`wait_for`], which cancels
//! the task it gave up on.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use crate::error::{Error, TaskFailure};
use crate::sleep::{Sleep, sleep};
use crate::task::{Join, Outcome, TaskHandle, TaskId};
use crate::time::Duration;

/// Outcome of every input task, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinatorResult<T> {
    outcomes: Vec<(TaskId, Outcome<T>)>,
}

impl<T> CombinatorResult<T> {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(TaskId, Outcome<T>)> {
        self.outcomes.iter()
    }

    pub fn get(&self, task: TaskId) -> Option<&Outcome<T>> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == task)
            .map(|(_, outcome)| outcome)
    }

    /// First failure in input order, regardless of when it happened.
    pub fn first_failure(&self) -> Option<&TaskFailure> {
        self.outcomes.iter().find_map(|(_, outcome)| outcome.failure())
    }

    pub fn into_outcomes(self) -> Vec<(TaskId, Outcome<T>)> {
        self.outcomes
    }
}

/// Waits for every task to reach a terminal state.
///
/// Resolves to `Err` with the first failure in input order, but only after
/// all tasks are done; failures do not cancel siblings. Cancelled inputs show
/// up as [`Outcome::Cancelled`].
pub fn gather<T, I>(tasks: I) -> Gather<T>
where
    T: Clone,
    I: IntoIterator<Item = TaskHandle<T>>,
{
    let joins: Vec<Join<T>> = tasks.into_iter().map(|task| task.join()).collect();
    let outcomes = joins.iter().map(|_| None).collect();
    Gather { joins, outcomes }
}

#[must_use = "futures do nothing unless polled"]
pub struct Gather<T> {
    joins: Vec<Join<T>>,
    outcomes: Vec<Option<Outcome<T>>>,
}

// Fields are never pinned.
impl<T> Unpin for Gather<T> {}

impl<T: Clone> Future for Gather<T> {
    type Output = Result<CombinatorResult<T>, TaskFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        for (join, slot) in this.joins.iter_mut().zip(this.outcomes.iter_mut()) {
            if slot.is_none() {
                if let Poll::Ready(outcome) = Pin::new(join).poll(cx) {
                    *slot = Some(outcome);
                }
            }
        }
        if this.outcomes.iter().any(Option::is_none) {
            return Poll::Pending;
        }

        let outcomes: Vec<_> = this
            .joins
            .iter()
            .zip(this.outcomes.iter_mut())
            .filter_map(|(join, slot)| slot.take().map(|outcome| (join.task_id(), outcome)))
            .collect();
        let result = CombinatorResult { outcomes };

        match result.first_failure() {
            Some(failure) => Poll::Ready(Err(failure.clone())),
            None => Poll::Ready(Ok(result)),
        }
    }
}

/// Waits for the first task to reach any terminal state.
///
/// Resolves to its index and outcome, or `None` for an empty input. The
/// other tasks keep running.
pub fn wait_any<T, I>(tasks: I) -> WaitAny<T>
where
    T: Clone,
    I: IntoIterator<Item = TaskHandle<T>>,
{
    WaitAny {
        joins: tasks.into_iter().map(|task| task.join()).collect(),
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct WaitAny<T> {
    joins: Vec<Join<T>>,
}

impl<T: Clone> Future for WaitAny<T> {
    type Output = Option<(usize, Outcome<T>)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        if this.joins.is_empty() {
            return Poll::Ready(None);
        }

        for (index, join) in this.joins.iter_mut().enumerate() {
            if let Poll::Ready(outcome) = Pin::new(join).poll(cx) {
                return Poll::Ready(Some((index, outcome)));
            }
        }
        Poll::Pending
    }
}

/// Like [`gather`], without the values.
pub fn wait_all<T, I>(tasks: I) -> WaitAll<T>
where
    T: Clone,
    I: IntoIterator<Item = TaskHandle<T>>,
{
    WaitAll {
        gather: gather(tasks),
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct WaitAll<T> {
    gather: Gather<T>,
}

impl<T: Clone> Future for WaitAll<T> {
    type Output = Result<(), TaskFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        Pin::new(&mut this.gather).poll(cx).map(|result| result.map(drop))
    }
}

/// Waits for `task` at most `timeout`; on expiry the task is cancelled and
/// [`Error::Timeout`] returned.
pub fn wait_for<T: Clone>(task: TaskHandle<T>, timeout: Duration) -> WaitFor<T> {
    WaitFor {
        join: task.join(),
        task,
        timer: sleep(timeout),
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct WaitFor<T> {
    task: TaskHandle<T>,
    join: Join<T>,
    timer: Sleep,
}

impl<T: Clone> Future for WaitFor<T> {
    type Output = Result<Outcome<T>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        if let Poll::Ready(outcome) = Pin::new(&mut this.join).poll(cx) {
            return Poll::Ready(Ok(outcome));
        }

        match Pin::new(&mut this.timer).poll(cx) {
            Poll::Ready(Ok(())) => {
                log::debug!("{} timed out", this.task.id());
                Poll::Ready(this.task.cancel().and(Err(Error::Timeout)))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}
