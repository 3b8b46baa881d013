use core::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Waker;

use critical_section::Mutex;
use futures::task::ArcWake;
use portable_atomic::{AtomicBool, Ordering};

use crate::task::TaskId;

/// Tasks woken since the loop last looked.
///
/// Wakers may be cloned into other threads, so this is the only piece of loop
/// state that is shared across threads.
pub(crate) struct WakeQueue {
    woken: Mutex<RefCell<VecDeque<TaskId>>>,
}

impl core::fmt::Debug for WakeQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        critical_section::with(|cs| {
            f.debug_struct("WakeQueue")
                .field("woken", &self.woken.borrow_ref(cs))
                .finish()
        })
    }
}

impl WakeQueue {
    pub(crate) fn new() -> Self {
        Self {
            woken: Mutex::new(RefCell::new(VecDeque::new())),
        }
    }

    fn push(&self, task: TaskId) {
        critical_section::with(|cs| self.woken.borrow_ref_mut(cs).push_back(task));
    }

    pub(crate) fn take_all(&self) -> VecDeque<TaskId> {
        critical_section::with(|cs| core::mem::take(&mut *self.woken.borrow_ref_mut(cs)))
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        critical_section::with(|cs| self.woken.borrow_ref(cs).is_empty())
    }
}

/// Waker of a single task.
///
/// Repeated wakes before the task gets polled are collapsed into one.
#[derive(Debug)]
pub(crate) struct TaskWaker {
    task: TaskId,
    queued: AtomicBool,
    queue: Arc<WakeQueue>,
}

impl TaskWaker {
    pub(crate) fn new(task: TaskId, queue: Arc<WakeQueue>) -> Arc<Self> {
        Arc::new(Self {
            task,
            queued: AtomicBool::new(false),
            queue,
        })
    }

    /// Called right before the task is polled; wakes after this point queue it again.
    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    pub(crate) fn waker(self: &Arc<Self>) -> Waker {
        futures::task::waker(self.clone())
    }
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.queued.swap(true, Ordering::AcqRel) {
            arc_self.queue.push(arc_self.task);
        }
    }
}
