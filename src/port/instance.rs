use std::{
    fmt,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{
    clock::{Clock, SystemClock},
    engine::EngineCallbacks,
    event::{EventKind, EventQueue},
    pool::ListenSocketPool,
    serial::{SerialDevice, SerialMode},
    tcp::TcpState,
    timer::Timer,
};

/// Longest single wait inside [`Instance::event_get`].
pub const MAX_POLL_DURATION: Duration = Duration::from_millis(100);

/// Largest serial protocol data unit, address and checksum included.
pub const MAX_SERIAL_FRAME: usize = 256;

/// Default frame buffer capacity: an MBAP header plus the largest serial frame.
pub const DEFAULT_FRAME_CAPACITY: usize = super::tcp::MBAP_HEADER_LEN + MAX_SERIAL_FRAME;

/// Transport an instance serves.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Tcp,
    Rtu,
    Ascii,
}

impl TransportMode {
    pub fn is_serial(self) -> bool {
        matches!(self, TransportMode::Rtu | TransportMode::Ascii)
    }
}

#[derive(Default)]
pub(crate) struct SerialState {
    pub(crate) mode: SerialMode,
    pub(crate) device: Option<Box<dyn SerialDevice>>,
}

/// One Modbus endpoint: its frame buffer, cursors, event counters, timer and
/// transport state.
///
/// An instance is owned by the thread running its event loop. The only state
/// it shares with other instances is the listen socket pool.
pub struct Instance {
    pub(crate) name: String,
    pub(crate) mode: TransportMode,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) frame: Vec<u8>,
    pub(crate) bytes_in_buffer: usize,
    pub(crate) rx_position: usize,
    pub(crate) tx_position: usize,
    pub(crate) events: EventQueue,
    pub(crate) timer: Timer,
    pub(crate) serial: SerialState,
    pub(crate) tcp: TcpState,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("frame_capacity", &self.frame.len())
            .field("bytes_in_buffer", &self.bytes_in_buffer)
            .field("events", &self.events)
            .field("timer", &self.timer)
            .field("serial_mode", &self.serial.mode)
            .field("tcp", &self.tcp)
            .finish()
    }
}

impl Instance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn frame_capacity(&self) -> usize {
        self.frame.len()
    }

    pub fn bytes_in_buffer(&self) -> usize {
        self.bytes_in_buffer
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn event_init(&mut self) -> bool {
        self.events.reset();
        true
    }

    /// Queues `kind`. Returns `false` if that kind's counter is saturated.
    pub fn event_post(&mut self, kind: EventKind) -> bool {
        let accepted = self.events.post(kind);
        if !accepted {
            log::debug!("{}: dropped {kind} event, counter saturated", self.name);
        }
        accepted
    }

    /// Blocks until an event is available or [`MAX_POLL_DURATION`] elapsed.
    ///
    /// Serial modes check the timer, then wait for serial traffic no longer
    /// than the timer's deadline, then check the timer again. TCP mode waits
    /// on the connection multiplexer. Queued events are taken between every
    /// step, in priority order.
    pub fn event_get<E: EngineCallbacks + ?Sized>(&mut self, engine: &mut E) -> Option<EventKind> {
        if let Some(kind) = self.events.get() {
            return Some(kind);
        }

        let now = self.clock.now();
        let wait_limit = now + MAX_POLL_DURATION;

        if self.mode.is_serial() {
            let timer_deadline = self.timer_poll(engine, now);
            if let Some(kind) = self.events.get() {
                return Some(kind);
            }

            let deadline = timer_deadline.map_or(wait_limit, |d| d.min(wait_limit));
            self.serial_poll(engine, deadline);
            if let Some(kind) = self.events.get() {
                return Some(kind);
            }

            let now = self.clock.now();
            self.timer_poll(engine, now);
        } else {
            self.tcp_poll(wait_limit);
        }

        self.events.get()
    }
}

/// Builds an [`Instance`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use mbport::port::{InstanceBuilder, ListenSocketPool, TransportMode};
///
/// let pool = Arc::new(ListenSocketPool::new(4));
/// let mut port = InstanceBuilder::new(TransportMode::Tcp)
///     .with_name("tcp-0")
///     .with_pool(pool)
///     .build();
/// assert!(port.tcp_init(1502));
/// ```
pub struct InstanceBuilder {
    name: Option<String>,
    mode: TransportMode,
    clock: Arc<dyn Clock>,
    frame_capacity: usize,
    serial: Option<Box<dyn SerialDevice>>,
    pool: Option<Arc<ListenSocketPool>>,
    keepalive: Duration,
}

impl InstanceBuilder {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            name: None,
            mode,
            clock: Arc::new(SystemClock::new()),
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            serial: None,
            pool: None,
            keepalive: Duration::ZERO,
        }
    }

    /// Name used in log lines.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_frame_capacity(mut self, capacity: usize) -> Self {
        self.frame_capacity = capacity;
        self
    }

    pub fn with_serial(mut self, device: Box<dyn SerialDevice>) -> Self {
        self.serial = Some(device);
        self
    }

    /// Pool shared with the other TCP instances. Without one the instance
    /// gets a private single-slot pool.
    pub fn with_pool(mut self, pool: Arc<ListenSocketPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Idle time after which a connected client is dropped; zero disables it.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn build(self) -> Instance {
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(ListenSocketPool::new(1)));
        Instance {
            name: self.name.unwrap_or_else(|| self.mode.to_string()),
            mode: self.mode,
            clock: self.clock,
            frame: vec![0; self.frame_capacity],
            bytes_in_buffer: 0,
            rx_position: 0,
            tx_position: 0,
            events: EventQueue::new(),
            timer: Timer::default(),
            serial: SerialState {
                mode: SerialMode::Disabled,
                device: self.serial,
            },
            tcp: TcpState::new(pool, self.keepalive),
        }
    }
}
