use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use crate::context;
use crate::task::WaitCondition;

/// Gives up the rest of the current drain cycle.
pub fn yield_now() -> Yield {
    Yield::new()
}

#[derive(Debug, Copy, Clone)]
#[must_use = "futures do nothing unless polled"]
pub struct Yield {
    ready: bool,
}

impl Yield {
    pub(crate) fn new() -> Self {
        Self { ready: false }
    }
}

impl Future for Yield {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.ready {
            Poll::Ready(())
        } else {
            Pin::into_inner(self).ready = true;
            context::set_wait(WaitCondition::Yield);
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
