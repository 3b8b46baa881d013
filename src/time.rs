use std::cell::Cell;
use std::rc::Rc;

/// Point in time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(i64);

impl Instant {
    pub const MIN: Self = Instant(i64::MIN);
    pub const MAX: Self = Instant(i64::MAX);

    pub const fn new(ticks: i64) -> Self {
        Self(ticks)
    }

    pub fn ticks(&self) -> i64 {
        self.0
    }
}

impl Default for Instant {
    fn default() -> Self {
        Instant::new(0)
    }
}

impl core::fmt::Display for Instant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "tick {}", self.0)
    }
}

/// Length of time interval between two Instants.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(i64);

impl Duration {
    pub const ZERO: Self = Duration(0);
    pub const MAX: Self = Duration(i64::MAX);

    pub const fn new(ticks: i64) -> Self {
        Self(ticks)
    }

    /// With [`SystemClock`] one tick is one millisecond.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn ticks(&self) -> i64 {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

impl core::fmt::Display for Duration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.0 == 1 {
            write!(f, "1 tick")
        } else {
            write!(f, "{} ticks", self.0)
        }
    }
}

// Tick arithmetic saturates instead of overflowing.
impl core::ops::Add<Duration> for Instant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl core::ops::Sub for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl core::ops::Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl core::ops::Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl core::ops::Mul<i64> for Duration {
    type Output = Self;

    fn mul(self, rhs: i64) -> Self::Output {
        Self(self.0.saturating_mul(rhs))
    }
}

impl core::ops::Div<i64> for Duration {
    type Output = Self;

    fn div(self, rhs: i64) -> Self::Output {
        Self(self.0.saturating_div(rhs))
    }
}

/// Time source of an event loop.
///
/// The loop asks for the current time to compute timer deadlines and calls
/// [`Clock::sleep_until`] when nothing is ready and the earliest timer lies in
/// the future.
pub trait Clock {
    fn now(&self) -> Instant;

    fn sleep_until(&self, deadline: Instant);
}

/// Wall clock backed by `std::time::Instant`. One tick is one millisecond.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let elapsed = self.origin.elapsed().as_millis();
        Instant::new(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }

    fn sleep_until(&self, deadline: Instant) {
        let remaining = deadline - self.now();
        if remaining > Duration::ZERO {
            std::thread::sleep(std::time::Duration::from_millis(remaining.ticks() as u64));
        }
    }
}

/// Virtual clock that never blocks.
///
/// Sleeping jumps straight to the deadline, so a loop driven by it runs
/// timer-heavy code instantly and deterministically. Clones share the same
/// time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::new(0))
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    /// Moves time forward. Negative durations are ignored, time is monotonic.
    pub fn advance(&self, by: Duration) {
        if by > Duration::ZERO {
            self.now.set(self.now.get() + by);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep_until(&self, deadline: Instant) {
        if deadline > self.now.get() {
            self.now.set(deadline);
        }
    }
}
