//! Porting layer between a portable Modbus engine and the host OS.
//!
//! An [`Instance`] owns one endpoint's frame buffer, event counters, timer and
//! transport. The engine drives it through [`Instance::event_get`] and the
//! `serial_*`, `tcp_*` and `timer_*` operations, and receives transport
//! notifications through [`EngineCallbacks`].

pub mod clock;
pub mod engine;
pub mod event;
pub mod instance;
pub mod pool;
mod readiness;
pub mod serial;
pub mod tcp;
pub mod timer;

pub use clock::{Clock, SystemClock};
pub use engine::{EngineCallbacks, NoOpEngine};
pub use event::{EventKind, EventQueue};
pub use instance::{
    Instance, InstanceBuilder, TransportMode, DEFAULT_FRAME_CAPACITY, MAX_POLL_DURATION,
};
pub use pool::{
    ListenSocketPool, ListenerOpener, SlotId, SlotStatus, SocketListenerOpener,
    DEFAULT_LISTEN_BACKLOG,
};
pub use serial::{Parity, SerialDevice, SerialMode, SerialPortDevice, SerialSettings};
pub use tcp::{DEFAULT_TCP_PORT, MBAP_HEADER_LEN};
pub use timer::{Timer, TIMER_UNIT};
