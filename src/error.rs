//! Error types of the porting layer and the translation tables between
//! OS-style error codes and the protocol engine's error enumeration.
//!
//! Everything that fails inside the port is a [`PortError`]. When a failure
//! has to cross into the engine it is first reduced to an errno-like code
//! with [`PortError::errno`] and then mapped with [`errno_to_engine`].

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io;
use strum::{Display, EnumIter};
use thiserror::Error;

/// Failure inside the porting layer.
#[derive(Debug, Error)]
pub enum PortError {
    /// The pool slot is already bound to another port.
    #[error("listen slot is bound to port {bound}, cannot bind port {requested}")]
    Busy { bound: u16, requested: u16 },

    /// Every pool slot is bound to some other port.
    #[error("no free listen socket slot for port {0}")]
    NoFreeSlot(u16),

    /// The MBAP header declared a frame larger than the frame buffer.
    #[error("declared frame size {declared} exceeds buffer capacity {capacity}")]
    FrameTooLarge { declared: usize, capacity: usize },

    /// The MBAP header declared a frame that cannot hold a protocol unit.
    #[error("malformed MBAP header: declared length {0}")]
    Framing(u16),

    /// No client is connected to the instance.
    #[error("no client connected")]
    NotConnected,

    /// Accepting one more client would exceed the number of bound instances.
    #[error("listen slot has no capacity left ({clients} clients, {binds} binds)")]
    PoolExhausted { clients: usize, binds: usize },

    /// An operation was invoked on an instance or slot in the wrong state.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),
}

pub type Result<T, E = PortError> = std::result::Result<T, E>;

impl PortError {
    /// OS-style error code describing this failure.
    pub fn errno(&self) -> i32 {
        match self {
            PortError::Busy { .. } => libc::EBUSY,
            PortError::NoFreeSlot(_) | PortError::PoolExhausted { .. } => libc::ENOMEM,
            PortError::FrameTooLarge { .. } => libc::EMSGSIZE,
            PortError::Framing(_) => libc::EPROTO,
            PortError::NotConnected => libc::ENOTCONN,
            PortError::IllegalState(_) => libc::ENOTRECOVERABLE,
            PortError::Io(err) => err.raw_os_error().unwrap_or(match err.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => libc::ETIMEDOUT,
                io::ErrorKind::InvalidInput => libc::EINVAL,
                io::ErrorKind::NotFound => libc::ENOENT,
                _ => libc::EIO,
            }),
            PortError::Serial(err) => match err.kind() {
                serialport::ErrorKind::NoDevice => libc::ENOENT,
                serialport::ErrorKind::InvalidInput => libc::EINVAL,
                serialport::ErrorKind::Io(kind) if kind == io::ErrorKind::TimedOut => {
                    libc::ETIMEDOUT
                }
                _ => libc::EIO,
            },
        }
    }

    /// Engine-side view of this failure.
    pub fn to_engine(&self) -> EngineError {
        errno_to_engine(self.errno())
    }
}

/// Error enumeration understood by the protocol engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum EngineError {
    /// No error.
    NoError = 0,
    /// Illegal register address.
    NoRegister = 1,
    /// Illegal argument.
    InvalidArgument = 2,
    /// Porting layer error.
    PortError = 3,
    /// Insufficient resources.
    NoResources = 4,
    /// I/O error.
    Io = 5,
    /// Protocol stack in illegal state.
    IllegalState = 6,
    /// Timeout.
    TimedOut = 7,
}

/// Maps an OS-style error code to the engine's enumeration.
///
/// Codes without a dedicated engine value become [`EngineError::PortError`].
pub fn errno_to_engine(code: i32) -> EngineError {
    match code {
        0 => EngineError::NoError,
        libc::ENOENT => EngineError::NoRegister,
        libc::EINVAL => EngineError::InvalidArgument,
        libc::ENOMEM => EngineError::NoResources,
        libc::EIO => EngineError::Io,
        libc::ENOTRECOVERABLE => EngineError::IllegalState,
        libc::ETIMEDOUT => EngineError::TimedOut,
        _ => EngineError::PortError,
    }
}

/// Maps an engine error to an OS-style error code.
pub fn engine_to_errno(error: EngineError) -> i32 {
    match error {
        EngineError::NoError => 0,
        EngineError::NoRegister => libc::ENOENT,
        EngineError::InvalidArgument => libc::EINVAL,
        EngineError::PortError => libc::ENETDOWN,
        EngineError::NoResources => libc::ENOMEM,
        EngineError::Io => libc::EIO,
        EngineError::IllegalState => libc::ENOTRECOVERABLE,
        EngineError::TimedOut => libc::ETIMEDOUT,
    }
}

/// Maps a raw engine error value to an OS-style error code.
///
/// Values outside the engine's enumeration become `EINVAL`.
pub fn engine_code_to_errno(raw: u8) -> i32 {
    EngineError::try_from(raw)
        .map(engine_to_errno)
        .unwrap_or(libc::EINVAL)
}
