//! mbport: porting layer for a portable Modbus protocol engine
//!
//! The [`port`] module supplies what the engine needs from its host: the
//! event queue and the blocking "next event" demultiplexer, the timer
//! scheduler, the serial transport, and the Modbus-TCP connection
//! multiplexer built on a reference-counted pool of shared listen sockets.
//!
//! [`server`] is a small `rmodbus`-backed slave engine that drives the port
//! layer end to end; [`config`] and [`cli`] wire it into the `mbport` binary.

pub mod cli;
pub mod config;
pub mod error;
pub mod port;
pub mod server;

pub use error::{EngineError, PortError};
pub use port::{
    EngineCallbacks, EventKind, Instance, InstanceBuilder, ListenSocketPool, TransportMode,
};
