use std::cell::RefCell;
use std::rc::Rc;

use futures::Future;

use crate::error::{Error, TaskFailure};
use crate::executor::EventLoop;
use crate::time::ManualClock;

/// Loop on a manual clock starting at tick 0.
pub(crate) fn test_loop() -> (EventLoop, ManualClock) {
    let clock = ManualClock::new();
    (EventLoop::with_clock(clock.clone()), clock)
}

/// Shared, ordered record of what happened during a test.
#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Rc<RefCell<Vec<String>>>);

impl Journal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

/// Runs `future` as the only task of a fresh test loop.
pub(crate) fn block_on<T: Clone + 'static>(
    future: impl Future<Output = Result<T, TaskFailure>> + 'static,
) -> Result<T, Error> {
    let (lp, _clock) = test_loop();
    let task = lp.spawn(future)?;
    lp.run_until(&task)
}
