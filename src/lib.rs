//! Single-threaded cooperative event loop.
//!
//! An [`EventLoop`] runs plain callbacks and tasks in drain cycles: every
//! callback that is ready when a cycle starts runs exactly once, in FIFO
//! order, and anything scheduled meanwhile waits for the next cycle. Timers
//! fire in deadline order, ties broken by scheduling order.
//!
//! Tasks are futures spawned on the loop. They suspend on [`sleep`], on other
//! tasks (`TaskHandle::join` and the [`combinator`] futures) or on an
//! [`AsyncMutex`], and can be cancelled while not running.

mod callback;
pub mod combinator;
mod context;
pub mod error;
pub mod executor;
mod sleep;
pub mod sync;
pub mod task;
pub mod time;
mod timer;
mod waker;
mod yield_now;

#[cfg(test)]
mod test_utils;

pub use callback::CallbackHandle;
pub use combinator::{CombinatorResult, gather, wait_all, wait_any, wait_for};
pub use context::current_task;
pub use error::{CancelOutcome, Error, TaskFailure};
pub use executor::{EventLoop, LoopHandle};
pub use sleep::{Sleep, sleep};
pub use sync::{AsyncMutex, MutexGuard, MutexId};
pub use task::{Join, Outcome, TaskHandle, TaskId, TaskState, WaitCondition};
pub use time::{Clock, Duration, Instant, ManualClock, SystemClock};
pub use yield_now::{Yield, yield_now};
