use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Time source shared by the timer scheduler and the transports.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Blocks the calling thread until `deadline`. Returns at once when the
    /// deadline already passed.
    fn sleep_until(&self, deadline: Instant);

    /// Smallest duration the scheduler can represent.
    fn tick(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn sleep_for(&self, duration: Duration) {
        self.sleep_until(self.now() + duration);
    }
}

/// Wall clock backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    tick: Duration,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::with_tick(Duration::from_millis(1))
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            tick: tick.max(Duration::from_nanos(1)),
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
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }

    fn tick(&self) -> Duration {
        self.tick
    }
}

/// Virtual clock for tests: sleeping advances time instead of blocking.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
    tick: Duration,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self::with_tick(Duration::from_millis(1))
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            tick: tick.max(Duration::from_nanos(1)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

#[cfg(test)]
impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }

    fn sleep_until(&self, deadline: Instant) {
        let mut now = self.now.lock();
        if deadline > *now {
            *now = deadline;
        }
    }

    fn tick(&self) -> Duration {
        self.tick
    }
}

/// Rounds `duration` up to a whole number of `tick`s; zero becomes one tick.
pub fn round_up_to_tick(duration: Duration, tick: Duration) -> Duration {
    let tick_ns = tick.as_nanos().max(1);
    let ticks = duration.as_nanos().div_ceil(tick_ns).max(1);
    let total = ticks.saturating_mul(tick_ns).min(u64::MAX as u128);
    Duration::from_nanos(total as u64)
}
