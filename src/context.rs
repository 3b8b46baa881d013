//! Which task is being polled right now.
//!
//! Set by the loop for the duration of a single poll. Leaf futures use it to
//! find their loop and to record what the task is waiting on.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::executor::Core;
use crate::task::{TaskId, WaitCondition};

#[derive(Clone)]
pub(crate) struct Current {
    pub(crate) core: Weak<Core>,
    pub(crate) task: TaskId,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

/// Restores the previously polled task when dropped, so loops can nest.
pub(crate) struct EnterGuard {
    previous: Option<Current>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

pub(crate) fn enter(core: &Rc<Core>, task: TaskId) -> EnterGuard {
    let entered = Current {
        core: Rc::downgrade(core),
        task,
    };
    let previous = CURRENT.with(|current| current.borrow_mut().replace(entered));
    EnterGuard { previous }
}

pub(crate) fn current() -> Option<Current> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Id of the task whose body is executing, if any.
pub fn current_task() -> Option<TaskId> {
    CURRENT.with(|current| current.borrow().as_ref().map(|c| c.task))
}

/// Records what the current task is about to suspend on.
pub(crate) fn set_wait(condition: WaitCondition) {
    if let Some(Current { core, task }) = current() {
        if let Some(core) = core.upgrade() {
            core.set_wait(task, condition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_loop;

    #[test]
    fn no_task_outside_the_loop() {
        assert_eq!(current_task(), None);
    }

    #[test]
    fn current_task_is_visible_inside_the_body() {
        let (lp, _clock) = test_loop();
        let task = lp
            .spawn(async { Ok(current_task()) })
            .unwrap();

        let seen = lp.run_until(&task).unwrap();
        assert_eq!(seen, Some(task.id()));
        assert_eq!(current_task(), None);
    }
}
