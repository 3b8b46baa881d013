#![deny(unsafe_code)]

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use crate::callback::{Action, CallbackHandle};
use crate::context;
use crate::error::Error;
use crate::task::WaitCondition;
use crate::time::Duration;

/// Suspends the current task for `delay`.
///
/// Always suspends at least once, so `sleep(Duration::ZERO)` lets the other
/// ready work run first.
pub fn sleep(delay: Duration) -> Sleep {
    Sleep { delay, timer: None }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    delay: Duration,
    timer: Option<CallbackHandle>,
}

impl Future for Sleep {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        if let Some(timer) = &this.timer {
            let Some(core) = timer.core() else {
                return Poll::Ready(Err(Error::LoopClosed));
            };
            let Some(key) = timer.key() else {
                return Poll::Ready(Ok(()));
            };
            if !core.timer_pending(key) {
                // Fired.
                this.timer = None;
                return Poll::Ready(Ok(()));
            }
            core.refresh_timer(key, cx.waker());
            context::set_wait(WaitCondition::Timer(key.wake_time()));
            return Poll::Pending;
        }

        if this.delay.is_negative() {
            return Poll::Ready(Err(Error::InvalidDelay(this.delay)));
        }
        let Some(current) = context::current() else {
            return Poll::Ready(Err(Error::NoCurrentTask));
        };
        let Some(core) = current.core.upgrade() else {
            return Poll::Ready(Err(Error::LoopClosed));
        };

        match core.schedule_timer(this.delay, Action::Wake(cx.waker().clone())) {
            Ok(timer) => {
                if let Some(wake_time) = timer.when() {
                    context::set_wait(WaitCondition::Timer(wake_time));
                }
                this.timer = Some(timer);
                Poll::Pending
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
