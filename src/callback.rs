#![deny(unsafe_code)]

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::rc::{Rc, Weak};
use std::task::Waker;

use crate::executor::Core;
use crate::task::TaskId;
use crate::time::Instant;
use crate::timer::TimerKey;

/// Work item the loop runs when it reaches the front of the ready queue.
pub(crate) enum Action {
    /// Plain user callback.
    Call(Box<dyn FnOnce()>),
    /// Notify a waker; used for fired timers and task completion waiters.
    Wake(Waker),
    /// Poll the task body once.
    Resume(TaskId),
}

impl Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Call(_) => f.write_str("Call"),
            Action::Wake(_) => f.write_str("Wake"),
            Action::Resume(id) => write!(f, "Resume({id})"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Callback {
    action: Action,
    cancelled: Rc<Cell<bool>>,
}

impl Callback {
    pub(crate) fn new(action: Action) -> Self {
        Self {
            action,
            cancelled: Rc::new(Cell::new(false)),
        }
    }

    pub(crate) fn cancel_flag(&self) -> Rc<Cell<bool>> {
        self.cancelled.clone()
    }

    pub(crate) fn replace_waker(&mut self, waker: &Waker) {
        if let Action::Wake(current) = &mut self.action {
            if !current.will_wake(waker) {
                *current = waker.clone();
            }
        }
    }

    /// Returns the action unless the callback was cancelled.
    pub(crate) fn into_action(self) -> Option<Action> {
        if self.cancelled.get() {
            None
        } else {
            Some(self.action)
        }
    }
}

/// FIFO of callbacks ready to run.
#[derive(Debug, Default)]
pub(crate) struct CallbackQueue {
    ready: VecDeque<Callback>,
}

impl CallbackQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, callback: Callback) {
        self.ready.push_back(callback);
    }

    pub(crate) fn pop(&mut self) -> Option<Callback> {
        self.ready.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub(crate) fn take(&mut self) -> VecDeque<Callback> {
        core::mem::take(&mut self.ready)
    }
}

/// Handle to a callback scheduled with `schedule_soon` or `schedule_at`.
///
/// Cancelling is a no-op once the callback has run.
#[derive(Debug, Clone)]
pub struct CallbackHandle {
    cancelled: Rc<Cell<bool>>,
    timer: Option<(Weak<Core>, TimerKey)>,
}

impl CallbackHandle {
    pub(crate) fn soon(cancelled: Rc<Cell<bool>>) -> Self {
        Self {
            cancelled,
            timer: None,
        }
    }

    pub(crate) fn timer(cancelled: Rc<Cell<bool>>, core: Weak<Core>, key: TimerKey) -> Self {
        Self {
            cancelled,
            timer: Some((core, key)),
        }
    }

    /// Prevents the callback from running. Timers are removed from the heap.
    pub fn cancel(&self) {
        self.cancelled.set(true);
        if let Some((core, key)) = &self.timer {
            if let Some(core) = core.upgrade() {
                core.cancel_timer(*key);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Wake time of a timer callback.
    pub fn when(&self) -> Option<Instant> {
        self.timer.as_ref().map(|(_, key)| key.wake_time())
    }

    pub(crate) fn key(&self) -> Option<TimerKey> {
        self.timer.as_ref().map(|(_, key)| *key)
    }

    pub(crate) fn core(&self) -> Option<Rc<Core>> {
        self.timer.as_ref().and_then(|(core, _)| core.upgrade())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(log: &Rc<std::cell::RefCell<Vec<u32>>>, v: u32) -> Callback {
        let log = log.clone();
        Callback::new(Action::Call(Box::new(move || log.borrow_mut().push(v))))
    }

    #[test]
    fn fifo_and_cancellation() {
        let log = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut queue = CallbackQueue::new();

        queue.push(call(&log, 1));
        let second = call(&log, 2);
        let handle = CallbackHandle::soon(second.cancel_flag());
        queue.push(second);
        queue.push(call(&log, 3));

        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(handle.when(), None);
        assert_eq!(queue.len(), 3);

        while let Some(cb) = queue.pop() {
            if let Some(Action::Call(f)) = cb.into_action() {
                f();
            }
        }

        assert!(queue.is_empty());
        assert_eq!(*log.borrow(), vec![1, 3]);
    }
}
