use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use log::{debug, trace};

use crate::callback::{Action, Callback, CallbackHandle, CallbackQueue};
use crate::context;
use crate::error::{CancelOutcome, Error, TaskFailure};
use crate::task::{Outcome, Settle, TaskCell, TaskHandle, TaskId, TaskState, WaitCondition, Waiter};
use crate::time::{Clock, Duration, Instant, SystemClock};
use crate::timer::{TimerHeap, TimerKey};
use crate::waker::{TaskWaker, WakeQueue};

/// Single-threaded cooperative event loop.
///
/// Each drain cycle runs the callbacks that were ready when the cycle
/// started, in FIFO order, then moves due timers to the ready queue. Callbacks
/// scheduled during a cycle run in the next one. When nothing is ready the
/// loop sleeps on its [`Clock`] until the earliest timer.
///
/// Loops are independent values; nothing is shared between instances.
pub struct EventLoop {
    core: Rc<Core>,
}

/// Non-owning handle to an [`EventLoop`], for callbacks and task bodies.
///
/// Operations fail with [`Error::LoopClosed`] once the loop is closed or gone.
#[derive(Clone)]
pub struct LoopHandle {
    core: Weak<Core>,
}

pub(crate) struct Core {
    clock: Box<dyn Clock>,
    state: RefCell<LoopState>,
    wakeups: Arc<WakeQueue>,
}

struct LoopState {
    ready: CallbackQueue,
    timers: TimerHeap<Callback>,
    tasks: HashMap<TaskId, Slot>,
    next_task: u64,
    running: bool,
    stopping: bool,
    closed: bool,
}

/// Registry entry of a task that has not reached a terminal state.
struct Slot {
    task: Rc<dyn Settle>,
    /// Taken out while the body is being polled.
    body: Option<LocalBoxFuture<'static, ()>>,
    waker: Arc<TaskWaker>,
}

enum Cycle {
    Progress,
    Stopped,
    Idle,
}

/// Clears the running flag however the run call exits.
struct RunGuard {
    core: Rc<Core>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut state = self.core.state.borrow_mut();
        state.running = false;
        state.stopping = false;
    }
}

impl Core {
    fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            clock,
            state: RefCell::new(LoopState {
                ready: CallbackQueue::new(),
                timers: TimerHeap::new(),
                tasks: HashMap::new(),
                next_task: 0,
                running: false,
                stopping: false,
                closed: false,
            }),
            wakeups: Arc::new(WakeQueue::new()),
        }
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    fn schedule(&self, action: Action) -> Result<CallbackHandle, Error> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(Error::LoopClosed);
        }
        let callback = Callback::new(action);
        let handle = CallbackHandle::soon(callback.cancel_flag());
        state.ready.push(callback);
        Ok(handle)
    }

    pub(crate) fn schedule_call(&self, call: Box<dyn FnOnce()>) -> Result<CallbackHandle, Error> {
        self.schedule(Action::Call(call))
    }

    pub(crate) fn schedule_timer(
        self: &Rc<Self>,
        delay: Duration,
        action: Action,
    ) -> Result<CallbackHandle, Error> {
        if delay.is_negative() {
            return Err(Error::InvalidDelay(delay));
        }
        let wake_time = self.now() + delay;

        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(Error::LoopClosed);
        }
        let callback = Callback::new(action);
        let flag = callback.cancel_flag();
        let key = state.timers.insert(wake_time, callback);
        trace!("timer armed for {wake_time}");
        Ok(CallbackHandle::timer(flag, Rc::downgrade(self), key))
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) -> bool {
        let removed = self.state.borrow_mut().timers.remove(key);
        removed.is_some()
    }

    pub(crate) fn timer_pending(&self, key: TimerKey) -> bool {
        self.state.borrow().timers.contains(key)
    }

    pub(crate) fn refresh_timer(&self, key: TimerKey, waker: &Waker) {
        if let Some(callback) = self.state.borrow_mut().timers.get_mut(key) {
            callback.replace_waker(waker);
        }
    }

    fn spawn<T, F>(self: &Rc<Self>, body: F) -> Result<TaskHandle<T>, Error>
    where
        T: 'static,
        F: Future<Output = Result<T, TaskFailure>> + 'static,
    {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(Error::LoopClosed);
        }
        let id = TaskId::new(state.next_task);
        state.next_task += 1;

        let cell = Rc::new(TaskCell::new(id));
        let settle = cell.clone();
        let body = async move {
            let outcome = match body.await {
                Ok(value) => Outcome::Finished(value),
                Err(failure) => Outcome::Failed(failure),
            };
            settle.settle(outcome);
        }
        .boxed_local();

        state.tasks.insert(
            id,
            Slot {
                task: cell.clone(),
                body: Some(body),
                waker: TaskWaker::new(id, self.wakeups.clone()),
            },
        );
        state.ready.push(Callback::new(Action::Resume(id)));
        debug!("spawned {id}");

        Ok(TaskHandle::new(cell, Rc::downgrade(self)))
    }

    pub(crate) fn set_wait(&self, task: TaskId, condition: WaitCondition) {
        if let Some(slot) = self.state.borrow().tasks.get(&task) {
            slot.task.header().set_wait(Some(condition));
        }
    }

    /// Polls the task body once.
    fn resume(self: &Rc<Self>, id: TaskId) {
        let (task, mut body, waker) = {
            let mut state = self.state.borrow_mut();
            let Some(slot) = state.tasks.get_mut(&id) else {
                // Finished or cancelled since the wake-up was queued.
                return;
            };
            let Some(body) = slot.body.take() else {
                return;
            };
            (slot.task.clone(), body, slot.waker.clone())
        };

        let header = task.header();
        waker.clear_queued();
        header.set_wait(None);
        header.set_state(TaskState::Running);
        trace!("resuming {id}");

        let waker = waker.waker();
        let mut cx = Context::from_waker(&waker);
        let poll = {
            let _enter = context::enter(self, id);
            body.as_mut().poll(&mut cx)
        };

        match poll {
            Poll::Ready(()) => {
                let slot = self.state.borrow_mut().tasks.remove(&id);
                drop(slot);
                drop(body);
                debug!("{id} reached {:?}", header.state());
                self.finish(&*task);
            }
            Poll::Pending => {
                header.set_state(TaskState::Suspended);
                trace!("{id} suspended on {:?}", header.wait());
                if let Some(slot) = self.state.borrow_mut().tasks.get_mut(&id) {
                    slot.body = Some(body);
                }
            }
        }
    }

    /// Schedules every waiter of a task that just became terminal.
    fn finish(&self, task: &dyn Settle) {
        let waiters = task.header().take_waiters();
        let mut state = self.state.borrow_mut();
        for waiter in waiters {
            let action = match waiter {
                Waiter::Wake(waker) => Action::Wake(waker),
                Waiter::Call(call) => Action::Call(call),
            };
            state.ready.push(Callback::new(action));
        }
    }

    pub(crate) fn cancel(&self, id: TaskId) -> Result<CancelOutcome, Error> {
        let slot = {
            let mut state = self.state.borrow_mut();
            match state.tasks.get(&id).map(|slot| slot.task.header().state()) {
                None => return Ok(CancelOutcome::AlreadyTerminal),
                Some(TaskState::Running) => return Err(Error::TaskRunning),
                Some(_) => state.tasks.remove(&id),
            }
        };
        let Some(Slot { task, body, .. }) = slot else {
            return Ok(CancelOutcome::AlreadyTerminal);
        };

        // Dropping the body unregisters it from timers, lock queues and other
        // tasks, and releases any held lock guard.
        drop(body);
        task.settle_cancelled();
        debug!("cancelled {id}");
        self.finish(&*task);
        Ok(CancelOutcome::Cancelled)
    }

    fn collect_wakeups(&self) {
        let woken = self.wakeups.take_all();
        if woken.is_empty() {
            return;
        }
        let mut state = self.state.borrow_mut();
        for id in woken {
            state.ready.push(Callback::new(Action::Resume(id)));
        }
    }

    fn fire_timers(&self) {
        let now = self.now();
        let mut state = self.state.borrow_mut();
        let expired = state.timers.pop_expired(now);
        if !expired.is_empty() {
            trace!("{} timer(s) fired at {now}", expired.len());
        }
        for callback in expired {
            state.ready.push(callback);
        }
    }

    fn run_callback(self: &Rc<Self>, callback: Callback) {
        match callback.into_action() {
            Some(Action::Call(call)) => call(),
            Some(Action::Wake(waker)) => waker.wake(),
            Some(Action::Resume(id)) => self.resume(id),
            None => trace!("skipping cancelled callback"),
        }
    }

    /// One drain cycle. Returns right after the batch once `done` holds, so a
    /// finished target never waits on unrelated timers.
    fn run_cycle(self: &Rc<Self>, done: &dyn Fn() -> bool) -> Cycle {
        self.collect_wakeups();

        let batch = self.state.borrow().ready.len();
        for _ in 0..batch {
            let next = self.state.borrow_mut().ready.pop();
            match next {
                Some(callback) => self.run_callback(callback),
                None => break,
            }
        }

        let stopping = core::mem::take(&mut self.state.borrow_mut().stopping);
        if stopping {
            debug!("event loop stopped");
            return Cycle::Stopped;
        }
        if done() {
            return Cycle::Progress;
        }

        self.collect_wakeups();
        self.fire_timers();
        if !self.state.borrow().ready.is_empty() {
            return Cycle::Progress;
        }

        let deadline = self.state.borrow().timers.peek_deadline();
        match deadline {
            Some(deadline) => {
                trace!("idle until {deadline}");
                self.clock.sleep_until(deadline);
                self.fire_timers();
                Cycle::Progress
            }
            None => Cycle::Idle,
        }
    }

    fn enter_run(self: &Rc<Self>) -> Result<RunGuard, Error> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(Error::LoopClosed);
        }
        if state.running {
            return Err(Error::AlreadyRunning);
        }
        state.running = true;
        Ok(RunGuard { core: self.clone() })
    }

    fn stop(&self) {
        self.state.borrow_mut().stopping = true;
    }

    fn close(&self) -> Result<(), Error> {
        let (tasks, ready, timers) = {
            let mut state = self.state.borrow_mut();
            if state.running {
                return Err(Error::LoopNotStopped);
            }
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (
                core::mem::take(&mut state.tasks),
                state.ready.take(),
                state.timers.take(),
            )
        };

        let mut tasks: Vec<_> = tasks.into_iter().collect();
        tasks.sort_by_key(|(id, _)| *id);
        for (id, slot) in tasks {
            drop(slot.body);
            slot.task.settle_cancelled();
            drop(slot.task.header().take_waiters());
            trace!("{id} cancelled by close");
        }
        drop(ready);
        drop(timers);
        // Wake-ups caused by the drops above have nowhere to go.
        drop(self.wakeups.take_all());

        debug!("event loop closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

impl EventLoop {
    /// Loop driven by the wall clock, one tick per millisecond.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::new())
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            core: Rc::new(Core::new(Box::new(clock))),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            core: Rc::downgrade(&self.core),
        }
    }

    pub fn time(&self) -> Instant {
        self.core.now()
    }

    /// Runs `callback` in the next drain cycle.
    pub fn schedule_soon<F: FnOnce() + 'static>(&self, callback: F) -> Result<CallbackHandle, Error> {
        self.core.schedule_call(Box::new(callback))
    }

    /// Runs `callback` no earlier than `delay` from now.
    pub fn schedule_at<F: FnOnce() + 'static>(
        &self,
        delay: Duration,
        callback: F,
    ) -> Result<CallbackHandle, Error> {
        self.core.schedule_timer(delay, Action::Call(Box::new(callback)))
    }

    /// Registers a task; its first resumption runs as a soon-callback.
    pub fn spawn<T, F>(&self, body: F) -> Result<TaskHandle<T>, Error>
    where
        T: 'static,
        F: Future<Output = Result<T, TaskFailure>> + 'static,
    {
        self.core.spawn(body)
    }

    /// Runs drain cycles until `task` is terminal and returns its result.
    ///
    /// Fails with [`Error::Deadlock`] if nothing is left that could make
    /// progress; the loop stays usable afterwards.
    pub fn run_until<T: Clone + 'static>(&self, task: &TaskHandle<T>) -> Result<T, Error> {
        let _running = self.core.enter_run()?;
        loop {
            if task.is_done() {
                break;
            }
            let cycle = self.core.run_cycle(&|| task.is_done());
            if task.is_done() {
                break;
            }
            match cycle {
                Cycle::Progress => {}
                Cycle::Stopped => return Err(Error::StoppedBeforeComplete),
                Cycle::Idle => {
                    debug!("deadlock: {} cannot make progress", task.id());
                    return Err(Error::Deadlock);
                }
            }
        }
        task.result()
    }

    /// Runs drain cycles until [`stop`](Self::stop) is called. Can be called again afterwards.
    pub fn run_forever(&self) -> Result<(), Error> {
        let _running = self.core.enter_run()?;
        loop {
            match self.core.run_cycle(&|| false) {
                Cycle::Progress => {}
                Cycle::Stopped => return Ok(()),
                Cycle::Idle => {
                    debug!("deadlock: run_forever has no work and no timers");
                    return Err(Error::Deadlock);
                }
            }
        }
    }

    /// Makes the loop exit once the current batch of callbacks is done.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Cancels remaining tasks and drops all queued callbacks and timers.
    pub fn close(&self) -> Result<(), Error> {
        self.core.close()
    }

    pub fn is_running(&self) -> bool {
        self.core.state.borrow().running
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn timer_count(&self) -> usize {
        self.core.state.borrow().timers.len()
    }

    #[cfg(test)]
    pub(crate) fn task_count(&self) -> usize {
        self.core.state.borrow().tasks.len()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let _ = self.core.close();
    }
}

impl LoopHandle {
    /// Handle to the loop running the current task.
    pub fn current() -> Option<Self> {
        context::current().map(|current| Self { core: current.core })
    }

    fn core(&self) -> Result<Rc<Core>, Error> {
        self.core.upgrade().ok_or(Error::LoopClosed)
    }

    pub fn time(&self) -> Result<Instant, Error> {
        Ok(self.core()?.now())
    }

    pub fn schedule_soon<F: FnOnce() + 'static>(&self, callback: F) -> Result<CallbackHandle, Error> {
        self.core()?.schedule_call(Box::new(callback))
    }

    pub fn schedule_at<F: FnOnce() + 'static>(
        &self,
        delay: Duration,
        callback: F,
    ) -> Result<CallbackHandle, Error> {
        self.core()?
            .schedule_timer(delay, Action::Call(Box::new(callback)))
    }

    pub fn spawn<T, F>(&self, body: F) -> Result<TaskHandle<T>, Error>
    where
        T: 'static,
        F: Future<Output = Result<T, TaskFailure>> + 'static,
    {
        self.core()?.spawn(body)
    }

    pub fn stop(&self) {
        if let Some(core) = self.core.upgrade() {
            core.stop();
        }
    }

    pub fn close(&self) -> Result<(), Error> {
        match self.core.upgrade() {
            Some(core) => core.close(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.upgrade().is_none_or(|core| core.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;
    use crate::sleep;
    use crate::test_utils::{Journal, test_loop};

    #[test]
    fn soon_callbacks_run_in_fifo_order() {
        let (lp, _clock) = test_loop();
        let journal = Journal::new();

        for i in 0..5 {
            let journal = journal.clone();
            lp.schedule_soon(move || journal.push(format!("cb{i}")))
                .unwrap();
        }
        let stopper = lp.handle();
        lp.schedule_soon(move || stopper.stop()).unwrap();
        lp.run_forever().unwrap();

        assert_eq!(journal.entries(), ["cb0", "cb1", "cb2", "cb3", "cb4"]);
    }

    #[test]
    fn callbacks_scheduled_during_a_cycle_run_in_the_next_one() {
        let (lp, _clock) = test_loop();
        let journal = Journal::new();
        let handle = lp.handle();

        let (j, h) = (journal.clone(), handle.clone());
        lp.schedule_soon(move || {
            j.push("a");
            let j2 = j.clone();
            h.schedule_soon(move || j2.push("c")).unwrap();
            // Stop takes effect after the current batch, so "c" never runs.
            h.stop();
        })
        .unwrap();
        let j = journal.clone();
        lp.schedule_soon(move || j.push("b")).unwrap();

        lp.run_forever().unwrap();
        assert_eq!(journal.entries(), ["a", "b"]);

        let stopper = handle.clone();
        handle.schedule_soon(move || stopper.stop()).unwrap();
        lp.run_forever().unwrap();
        assert_eq!(journal.entries(), ["a", "b", "c"]);
    }

    #[test]
    fn self_rescheduling_callback_does_not_starve_the_loop() {
        fn tick(handle: LoopHandle, count: Rc<Cell<u32>>) {
            count.set(count.get() + 1);
            let next = handle.clone();
            handle.schedule_soon(move || tick(next, count)).unwrap();
        }

        let (lp, _clock) = test_loop();
        let count = Rc::new(Cell::new(0));
        let (h, c) = (lp.handle(), count.clone());
        lp.schedule_soon(move || tick(h, c)).unwrap();
        let stopper = lp.handle();
        lp.schedule_at(Duration::ZERO, move || stopper.stop())
            .unwrap();

        lp.run_forever().unwrap();
        // First cycle runs tick once, then the zero-delay timer stops the loop in the second.
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let (lp, clock) = test_loop();
        let journal = Journal::new();

        for (delay, name) in [(30, "late"), (10, "early"), (20, "middle")] {
            let (j, c) = (journal.clone(), clock.clone());
            lp.schedule_at(Duration::new(delay), move || {
                j.push(format!("{name}@{}", c.now().ticks()));
            })
            .unwrap();
        }
        let stopper = lp.handle();
        lp.schedule_at(Duration::new(30), move || stopper.stop())
            .unwrap();

        lp.run_forever().unwrap();
        assert_eq!(journal.entries(), ["early@10", "middle@20", "late@30"]);
        assert_eq!(lp.time(), Instant::new(30));
    }

    #[test]
    fn equal_deadlines_fire_in_scheduling_order() {
        let (lp, _clock) = test_loop();
        let journal = Journal::new();

        for i in 0..4 {
            let j = journal.clone();
            lp.schedule_at(Duration::new(5), move || j.push(format!("t{i}")))
                .unwrap();
        }
        let stopper = lp.handle();
        lp.schedule_at(Duration::new(5), move || stopper.stop())
            .unwrap();

        lp.run_forever().unwrap();
        assert_eq!(journal.entries(), ["t0", "t1", "t2", "t3"]);
    }

    #[test]
    fn call_soon_runs_before_call_later() {
        let (lp, clock) = test_loop();
        let journal = Journal::new();

        let j = journal.clone();
        let c = clock.clone();
        let work_a = lp
            .spawn(async move {
                j.push(format!("work A start @{}", c.now().ticks()));
                sleep(Duration::new(1000)).await?;
                j.push(format!("work A stop @{}", c.now().ticks()));
                Ok(())
            })
            .unwrap();

        for (delay, name) in [(1200, "Tom"), (1000, "Jerry")] {
            let (j, c) = (journal.clone(), clock.clone());
            lp.schedule_at(Duration::new(delay), move || {
                j.push(format!("hello {name} @{}", c.now().ticks()))
            })
            .unwrap();
        }
        let j = journal.clone();
        lp.schedule_soon(move || j.push("hello Kitty")).unwrap();

        let (j, c) = (journal.clone(), clock.clone());
        let work_b = lp
            .spawn(async move {
                j.push(format!("work B start @{}", c.now().ticks()));
                sleep(Duration::new(2000)).await?;
                j.push(format!("work B stop @{}", c.now().ticks()));
                Ok(())
            })
            .unwrap();

        lp.run_until(&work_b).unwrap();
        assert!(work_a.is_done());
        assert_eq!(
            journal.entries(),
            [
                "work A start @0",
                "hello Kitty",
                "work B start @0",
                "hello Jerry @1000",
                "work A stop @1000",
                "hello Tom @1200",
                "work B stop @2000",
            ]
        );
    }

    #[test]
    fn negative_delay_is_rejected() {
        let (lp, _clock) = test_loop();
        let err = lp.schedule_at(Duration::new(-1), || {}).unwrap_err();
        assert_eq!(err, Error::InvalidDelay(Duration::new(-1)));
        assert_eq!(lp.timer_count(), 0);
    }

    #[test]
    fn cancelled_callbacks_never_run() {
        let (lp, _clock) = test_loop();
        let ran = Rc::new(Cell::new(0));

        let r = ran.clone();
        let soon = lp.schedule_soon(move || r.set(r.get() + 1)).unwrap();
        let r = ran.clone();
        let later = lp
            .schedule_at(Duration::new(10), move || r.set(r.get() + 10))
            .unwrap();
        assert_eq!(later.when(), Some(Instant::new(10)));

        soon.cancel();
        later.cancel();
        assert_eq!(lp.timer_count(), 0);

        let task = lp.spawn(async { Ok(()) }).unwrap();
        lp.run_until(&task).unwrap();
        assert_eq!(ran.get(), 0);
    }

    #[test]
    fn run_until_reports_deadlock_and_loop_stays_usable() {
        let (lp, _clock) = test_loop();
        let stuck = lp
            .spawn(async {
                futures::future::pending::<()>().await;
                Ok(())
            })
            .unwrap();

        assert_eq!(lp.run_until(&stuck), Err(Error::Deadlock));
        assert_eq!(stuck.state(), TaskState::Suspended);
        assert!(!lp.is_running());

        assert_eq!(stuck.cancel(), Ok(CancelOutcome::Cancelled));
        let next = lp.spawn(async { Ok(5) }).unwrap();
        assert_eq!(lp.run_until(&next), Ok(5));
    }

    #[test]
    fn finished_target_does_not_wait_for_other_timers() {
        let (lp, clock) = test_loop();
        let sleeper = lp
            .spawn(async {
                sleep(Duration::new(10_000)).await?;
                Ok(())
            })
            .unwrap();
        let quick = lp.spawn(async { Ok(1) }).unwrap();

        assert_eq!(lp.run_until(&quick), Ok(1));
        assert_eq!(clock.now(), Instant::new(0));
        assert_eq!(lp.timer_count(), 1);
        assert_eq!(sleeper.state(), TaskState::Suspended);
    }

    #[test]
    fn finished_target_returns_promptly_on_the_system_clock() {
        let lp = EventLoop::new();
        lp.schedule_at(Duration::from_millis(60_000), || {}).unwrap();
        let quick = lp.spawn(async { Ok(()) }).unwrap();

        let started = std::time::Instant::now();
        assert_eq!(lp.run_until(&quick), Ok(()));
        assert!(started.elapsed() < std::time::Duration::from_secs(30));
    }

    #[test]
    fn run_forever_can_be_restarted_after_stop() {
        let (lp, clock) = test_loop();
        let journal = Journal::new();
        let handle = lp.handle();

        let (j, h, c) = (journal.clone(), handle.clone(), clock.clone());
        lp.spawn(async move {
            j.push("start");
            sleep(Duration::new(1)).await?;
            j.push(format!("stop after {}", c.now().ticks()));
            h.stop();
            sleep(Duration::new(1)).await?;
            j.push("resumed");
            h.stop();
            Ok(())
        })
        .unwrap();

        lp.run_forever().unwrap();
        assert_eq!(journal.entries(), ["start", "stop after 1"]);

        lp.run_forever().unwrap();
        assert_eq!(journal.entries(), ["start", "stop after 1", "resumed"]);

        lp.close().unwrap();
        assert!(lp.is_closed());
    }

    #[test]
    fn done_callback_stops_run_forever() {
        let (lp, clock) = test_loop();
        let handle = lp.handle();
        let task = lp
            .spawn(async {
                sleep(Duration::new(2)).await?;
                Ok(())
            })
            .unwrap();
        task.add_done_callback(move |_| handle.stop()).unwrap();

        lp.run_forever().unwrap();
        assert!(task.is_done());
        assert_eq!(clock.now(), Instant::new(2));
    }

    #[test]
    fn stop_interrupts_run_until() {
        let (lp, _clock) = test_loop();
        let handle = lp.handle();
        let task = lp
            .spawn(async move {
                handle.stop();
                sleep(Duration::new(5)).await?;
                Ok(())
            })
            .unwrap();

        assert_eq!(lp.run_until(&task), Err(Error::StoppedBeforeComplete));
        assert_eq!(lp.run_until(&task), Ok(()));
    }

    #[test]
    fn nested_run_is_rejected() {
        let (lp, _clock) = test_loop();
        let lp = Rc::new(lp);
        let seen = Rc::new(RefCell::new(None));

        let (inner, s) = (lp.clone(), seen.clone());
        lp.schedule_soon(move || *s.borrow_mut() = Some(inner.run_forever()))
            .unwrap();
        let task = lp.spawn(async { Ok(()) }).unwrap();
        lp.run_until(&task).unwrap();

        assert_eq!(*seen.borrow(), Some(Err(Error::AlreadyRunning)));
    }

    #[test]
    fn close_while_running_fails() {
        let (lp, _clock) = test_loop();
        let seen = Rc::new(RefCell::new(None));

        let (h, s) = (lp.handle(), seen.clone());
        lp.schedule_soon(move || *s.borrow_mut() = Some(h.close()))
            .unwrap();
        let task = lp.spawn(async { Ok(()) }).unwrap();
        lp.run_until(&task).unwrap();

        assert_eq!(*seen.borrow(), Some(Err(Error::LoopNotStopped)));
        assert!(!lp.is_closed());
    }

    #[test]
    fn close_cancels_remaining_work() {
        let (lp, _clock) = test_loop();
        let sleeper = lp
            .spawn(async {
                sleep(Duration::new(100)).await?;
                Ok(())
            })
            .unwrap();
        let first = lp.spawn(async { Ok(()) }).unwrap();
        lp.run_until(&first).unwrap();
        assert_eq!(lp.timer_count(), 1);

        lp.close().unwrap();
        assert_eq!(sleeper.state(), TaskState::Cancelled);
        assert_eq!(sleeper.result(), Err(Error::Cancelled));
        assert_eq!(lp.timer_count(), 0);
        assert_eq!(lp.task_count(), 0);

        assert_eq!(lp.close(), Ok(()));
        assert_eq!(lp.schedule_soon(|| {}).unwrap_err(), Error::LoopClosed);
        assert_eq!(
            lp.schedule_at(Duration::new(1), || {}).unwrap_err(),
            Error::LoopClosed
        );
        assert!(lp.spawn(async { Ok(()) }).is_err());
        assert_eq!(lp.run_forever(), Err(Error::LoopClosed));
        assert!(lp.handle().is_closed());
    }

    #[test]
    fn loops_are_independent() {
        let (a, clock_a) = test_loop();
        let (b, clock_b) = test_loop();

        let ta = a
            .spawn(async {
                sleep(Duration::new(10)).await?;
                Ok("a")
            })
            .unwrap();
        let tb = b
            .spawn(async {
                sleep(Duration::new(3)).await?;
                Ok("b")
            })
            .unwrap();

        assert_eq!(b.run_until(&tb), Ok("b"));
        assert_eq!(ta.state(), TaskState::Pending);
        assert_eq!(a.run_until(&ta), Ok("a"));
        assert_eq!(clock_a.now(), Instant::new(10));
        assert_eq!(clock_b.now(), Instant::new(3));
    }

    #[test]
    fn tasks_spawned_from_tasks_use_the_same_loop() {
        let (lp, _clock) = test_loop();
        let parent = lp
            .spawn(async {
                let handle = LoopHandle::current().ok_or(Error::NoCurrentTask)?;
                let child = handle.spawn(async { Ok(21) })?;
                Ok(child.join().await.into_result()? * 2)
            })
            .unwrap();

        assert_eq!(lp.run_until(&parent), Ok(42));
        assert!(LoopHandle::current().is_none());
    }

    #[test]
    fn wakers_from_other_threads_resume_tasks() {
        let (lp, _clock) = test_loop();
        let (tx, rx) = futures::channel::oneshot::channel::<u32>();
        let task = lp
            .spawn(async move {
                rx.await.map_err(|_| TaskFailure::new("sender dropped"))
            })
            .unwrap();

        let first = lp.spawn(async { Ok(()) }).unwrap();
        lp.run_until(&first).unwrap();
        assert_eq!(task.state(), TaskState::Suspended);

        std::thread::spawn(move || tx.send(9).unwrap())
            .join()
            .unwrap();
        assert_eq!(lp.run_until(&task), Ok(9));
    }
}
