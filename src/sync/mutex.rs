//! FIFO-fair lock for tasks.
//!
//! Acquiring a held lock suspends the task instead of blocking the thread.
//! On release the lock is handed straight to the longest waiting task, so no
//! other task can slip in between.
//!
//! A task that is cancelled while queued leaves the queue; a task cancelled
//! after the lock was handed to it, or while holding a [`MutexGuard`], passes
//! the lock on. A lock taken with the raw [`AsyncMutex::acquire`] is only
//! released by an explicit [`AsyncMutex::release`], so cancelling its owner
//! leaves it held.

use core::cell::RefCell;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;

use log::trace;
use portable_atomic::{AtomicU64, Ordering};

use crate::context;
use crate::error::Error;
use crate::task::{TaskId, WaitCondition};

static NEXT_MUTEX_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MutexId(u64);

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutex#{}", self.0)
    }
}

/// Current holder. The ticket tells apart two acquisitions by the same task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Owner {
    task: TaskId,
    ticket: u64,
}

#[derive(Debug)]
struct Waiter {
    owner: Owner,
    waker: Waker,
}

#[derive(Debug)]
struct MutexState {
    owner: Option<Owner>,
    wait_queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl MutexState {
    fn ticket(&mut self, task: TaskId) -> Owner {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        Owner { task, ticket }
    }
}

#[derive(Debug)]
pub struct AsyncMutex {
    id: MutexId,
    state: RefCell<MutexState>,
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncMutex {
    pub fn new() -> Self {
        Self {
            id: MutexId(NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed)),
            state: RefCell::new(MutexState {
                owner: None,
                wait_queue: VecDeque::new(),
                next_ticket: 0,
            }),
        }
    }

    pub fn id(&self) -> MutexId {
        self.id
    }

    pub fn is_locked(&self) -> bool {
        self.state.borrow().owner.is_some()
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.state.borrow().owner.map(|owner| owner.task)
    }

    /// Number of tasks queued for the lock.
    pub fn waiting(&self) -> usize {
        self.state.borrow().wait_queue.len()
    }

    /// Takes the lock for the current task, suspending while someone else holds it.
    ///
    /// Once this resolves, nothing releases the lock except
    /// [`release`](Self::release); if the task is cancelled before calling it
    /// the lock stays held for good. Use [`lock`](Self::lock) when the task
    /// may be cancelled, its guard releases on every exit path.
    pub fn acquire(&self) -> Acquire<'_> {
        Acquire {
            mutex: self,
            ticket: None,
            queued: false,
        }
    }

    /// Takes the lock if it is free, without suspending.
    pub fn try_acquire(&self) -> Result<bool, Error> {
        let task = context::current_task().ok_or(Error::NoCurrentTask)?;
        let mut state = self.state.borrow_mut();
        if state.owner.is_some() {
            return Ok(false);
        }
        let owner = state.ticket(task);
        state.owner = Some(owner);
        Ok(true)
    }

    /// Releases a lock taken with [`acquire`](Self::acquire) by the current task.
    pub fn release(&self) -> Result<(), Error> {
        let task = context::current_task().ok_or(Error::NoCurrentTask)?;
        let owner = self.state.borrow().owner;
        match owner {
            Some(owner) if owner.task == task => self.release_owner(owner),
            _ => Err(Error::NotOwner),
        }
    }

    /// Acquires the lock and returns a guard that releases it when dropped.
    pub async fn lock(&self) -> Result<MutexGuard<'_>, Error> {
        let mut acquire = self.acquire();
        (&mut acquire).await?;
        let owner = acquire.take_ownership().ok_or(Error::NotOwner)?;
        Ok(MutexGuard { mutex: self, owner })
    }

    /// Passes the lock to the first waiter, or frees it.
    fn release_owner(&self, owner: Owner) -> Result<(), Error> {
        let next = {
            let mut state = self.state.borrow_mut();
            if state.owner != Some(owner) {
                return Err(Error::NotOwner);
            }
            match state.wait_queue.pop_front() {
                Some(next) => {
                    state.owner = Some(next.owner);
                    Some(next)
                }
                None => {
                    state.owner = None;
                    None
                }
            }
        };

        match next {
            Some(next) => {
                trace!("{} handed from {} to {}", self.id, owner.task, next.owner.task);
                next.waker.wake();
            }
            None => trace!("{} released by {}", self.id, owner.task),
        }
        Ok(())
    }
}

/// Future returned by [`AsyncMutex::acquire`].
#[must_use = "futures do nothing unless polled"]
pub struct Acquire<'a> {
    mutex: &'a AsyncMutex,
    ticket: Option<Owner>,
    queued: bool,
}

impl Acquire<'_> {
    /// Hands the acquired lock to the caller; the future stops tracking it.
    fn take_ownership(&mut self) -> Option<Owner> {
        self.queued = false;
        self.ticket.take()
    }
}

impl Future for Acquire<'_> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        let mutex = this.mutex;

        if this.queued {
            let mut state = mutex.state.borrow_mut();
            if state.owner == this.ticket {
                this.queued = false;
                return Poll::Ready(Ok(()));
            }
            if let Some(waiter) = state
                .wait_queue
                .iter_mut()
                .find(|waiter| Some(waiter.owner) == this.ticket)
            {
                if !waiter.waker.will_wake(cx.waker()) {
                    waiter.waker = cx.waker().clone();
                }
            }
            drop(state);
            context::set_wait(WaitCondition::LockAcquire(mutex.id));
            return Poll::Pending;
        }

        if this.ticket.is_some() {
            // Already acquired and reported.
            return Poll::Ready(Ok(()));
        }

        let Some(task) = context::current_task() else {
            return Poll::Ready(Err(Error::NoCurrentTask));
        };

        let mut state = mutex.state.borrow_mut();
        let ticket = state.ticket(task);
        this.ticket = Some(ticket);

        if state.owner.is_none() {
            state.owner = Some(ticket);
            return Poll::Ready(Ok(()));
        }

        state.wait_queue.push_back(Waiter {
            owner: ticket,
            waker: cx.waker().clone(),
        });
        this.queued = true;
        drop(state);
        trace!("{task} waits for {}", mutex.id);
        context::set_wait(WaitCondition::LockAcquire(mutex.id));
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if !self.queued {
            return;
        }
        let Some(ticket) = self.ticket else {
            return;
        };

        let handed_over = {
            let mut state = self.mutex.state.borrow_mut();
            if state.owner == Some(ticket) {
                true
            } else {
                state.wait_queue.retain(|waiter| waiter.owner != ticket);
                false
            }
        };
        // Granted to us but never observed: pass it on.
        if handed_over {
            let _ = self.mutex.release_owner(ticket);
        }
    }
}

/// Holds an [`AsyncMutex`] until dropped.
pub struct MutexGuard<'a> {
    mutex: &'a AsyncMutex,
    owner: Owner,
}

impl MutexGuard<'_> {
    pub fn owner(&self) -> TaskId {
        self.owner.task
    }
}

impl fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard")
            .field("mutex", &self.mutex.id)
            .field("owner", &self.owner.task)
            .finish()
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // Fails only if the lock was already released by hand.
        let _ = self.mutex.release_owner(self.owner);
    }
}
