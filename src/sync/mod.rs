//! Synchronization between tasks of one event loop.

mod mutex;

pub use mutex::{Acquire, AsyncMutex, MutexGuard, MutexId};
