use std::time::{Duration, Instant};

use super::{clock::round_up_to_tick, engine::EngineCallbacks, instance::Instance};

/// Granularity of the engine's timer configuration requests.
pub const TIMER_UNIT: Duration = Duration::from_micros(50);

/// Single-shot deadline of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Instant>,
    duration: Duration,
}

impl Timer {
    /// `None` when the timer is not armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    fn configure(&mut self, duration: Duration) {
        self.duration = duration;
        self.deadline = None;
    }

    fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.duration);
    }

    fn disarm(&mut self) {
        self.deadline = None;
    }
}

impl Instance {
    /// Configures the timer to `units` × 50 µs, rounded up to the clock tick.
    pub fn timer_init(&mut self, units: u16) -> bool {
        let requested = TIMER_UNIT * u32::from(units);
        let duration = round_up_to_tick(requested, self.clock.tick());
        self.timer.configure(duration);
        log::debug!("{}: timer duration {:?}", self.name, duration);
        true
    }

    pub fn timer_enable(&mut self) {
        let now = self.clock.now();
        self.timer.arm(now);
    }

    pub fn timer_disable(&mut self) {
        self.timer.disarm();
    }

    /// The timer holds no OS resources; closing only disarms it.
    pub fn timer_close(&mut self) {
        self.timer.disarm();
    }

    /// Unconditional sleep.
    pub fn timer_delay(&self, milliseconds: u16) {
        self.clock
            .sleep_for(Duration::from_millis(u64::from(milliseconds)));
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Sleeps until the earlier of `deadline` and the timer's deadline. An
    /// expired timer is disarmed and reported to the engine.
    ///
    /// Returns the timer's deadline after the poll, `None` when unarmed.
    pub fn timer_poll<E: EngineCallbacks + ?Sized>(
        &mut self,
        engine: &mut E,
        deadline: Instant,
    ) -> Option<Instant> {
        let wake = match self.timer.deadline {
            Some(timer_deadline) => deadline.min(timer_deadline),
            None => deadline,
        };
        self.clock.sleep_until(wake);

        if let Some(timer_deadline) = self.timer.deadline {
            if self.clock.now() >= timer_deadline {
                self.timer.disarm();
                engine.timer_expired(self);
            }
        }

        self.timer.deadline
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::port::{
        clock::{Clock, ManualClock},
        instance::{InstanceBuilder, TransportMode},
    };

    #[derive(Default)]
    struct Expiries(Vec<Instant>);

    impl EngineCallbacks for Expiries {
        fn timer_expired(&mut self, port: &mut Instance) {
            self.0.push(port.clock().now());
        }
    }

    fn rtu_instance(clock: Arc<ManualClock>) -> Instance {
        InstanceBuilder::new(TransportMode::Rtu)
            .with_clock(clock)
            .build()
    }

    #[test]
    fn init_rounds_up_and_coerces_zero() {
        let clock = Arc::new(ManualClock::with_tick(Duration::from_millis(1)));
        let mut port = rtu_instance(clock);

        assert!(port.timer_init(35));
        assert_eq!(port.timer().duration(), Duration::from_millis(2));
        assert!(port.timer_init(0));
        assert_eq!(port.timer().duration(), Duration::from_millis(1));
        assert!(port.timer_init(40));
        assert_eq!(port.timer().duration(), Duration::from_millis(2));
        assert!(!port.timer().is_armed());
    }

    #[test]
    fn expires_once_and_never_early() {
        let clock = Arc::new(ManualClock::new());
        let mut port = rtu_instance(clock.clone());
        let mut engine = Expiries::default();
        port.timer_init(100);

        let t0 = clock.now();
        port.timer_enable();
        let expected = t0 + Duration::from_millis(5);
        assert_eq!(port.timer().deadline(), Some(expected));

        // An earlier external deadline wakes the poll without firing.
        let left = port.timer_poll(&mut engine, t0 + Duration::from_millis(2));
        assert_eq!(left, Some(expected));
        assert!(engine.0.is_empty());

        let left = port.timer_poll(&mut engine, t0 + Duration::from_secs(1));
        assert_eq!(left, None);
        assert_eq!(engine.0, vec![expected]);

        port.timer_poll(&mut engine, clock.now() + Duration::from_secs(1));
        assert_eq!(engine.0.len(), 1);
    }

    #[test]
    fn disable_suppresses_expiry() {
        let clock = Arc::new(ManualClock::new());
        let mut port = rtu_instance(clock.clone());
        let mut engine = Expiries::default();
        port.timer_init(20);
        port.timer_enable();
        port.timer_disable();

        let deadline = clock.now() + Duration::from_millis(10);
        assert_eq!(port.timer_poll(&mut engine, deadline), None);
        assert!(engine.0.is_empty());
        assert_eq!(clock.now(), deadline);
    }

    #[test]
    fn enable_rearms_from_now() {
        let clock = Arc::new(ManualClock::new());
        let mut port = rtu_instance(clock.clone());
        port.timer_init(20);
        port.timer_enable();
        clock.advance(Duration::from_micros(700));
        port.timer_enable();
        assert_eq!(
            port.timer().deadline(),
            Some(clock.now() + Duration::from_millis(1))
        );
    }

    #[test]
    fn delay_sleeps_through_the_clock() {
        let clock = Arc::new(ManualClock::new());
        let port = rtu_instance(clock.clone());
        let t0 = clock.now();
        port.timer_delay(25);
        assert_eq!(clock.now(), t0 + Duration::from_millis(25));
    }
}
