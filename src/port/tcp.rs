//! Modbus-TCP connection multiplexer.
//!
//! Each instance serves at most one client. While it has none it waits on its
//! pool slot's listen socket; once a client is adopted it waits on that
//! client and assembles MBAP frames into the instance's frame buffer.

use std::{
    fmt,
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    time::{Duration, Instant},
};

use super::{
    event::EventKind,
    instance::Instance,
    pool::{ListenSocketPool, SlotId},
    readiness::{wait_readable, Source},
};
use crate::error::PortError;

/// Size of the MBAP header, unit identifier included.
pub const MBAP_HEADER_LEN: usize = 7;

/// Port served when `tcp_init(0)` is requested.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Bytes preceding the part covered by the MBAP length field.
const MBAP_PREFIX_LEN: usize = 6;

/// Total frame size announced by a buffered MBAP prefix, or `None` while
/// fewer than six bytes are buffered.
pub fn declared_frame_len(buffered: &[u8]) -> Option<usize> {
    match buffered {
        [_, _, _, _, hi, lo, ..] => {
            Some(MBAP_PREFIX_LEN + usize::from(u16::from_be_bytes([*hi, *lo])))
        }
        _ => None,
    }
}

pub struct TcpState {
    pool: Arc<ListenSocketPool>,
    slot: Option<SlotId>,
    client: Option<TcpStream>,
    keepalive: Duration,
    keepalive_deadline: Option<Instant>,
}

impl fmt::Debug for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpState")
            .field("slot", &self.slot)
            .field("client", &self.client.as_ref().and_then(|c| c.peer_addr().ok()))
            .field("keepalive", &self.keepalive)
            .field("keepalive_deadline", &self.keepalive_deadline)
            .finish()
    }
}

impl TcpState {
    pub(crate) fn new(pool: Arc<ListenSocketPool>, keepalive: Duration) -> Self {
        Self {
            pool,
            slot: None,
            client: None,
            keepalive,
            keepalive_deadline: None,
        }
    }
}

/// Outcome of one multiplexer iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Keep waiting.
    Continue,
    /// A client was adopted; keep waiting without reaping it.
    Accepted,
    /// A complete frame was buffered and announced.
    Delivered,
    /// Timed out or failed; leave the poll.
    Return,
}

impl Step {
    fn runs_keepalive_check(self) -> bool {
        !matches!(self, Step::Accepted | Step::Delivered)
    }
}

impl Instance {
    /// Claims a listen socket slot for `port`; `0` selects port 502.
    pub fn tcp_init(&mut self, port: u16) -> bool {
        let port = if port == 0 { DEFAULT_TCP_PORT } else { port };
        if self.tcp.slot.is_some() {
            debug_assert!(false, "tcp_init on an instance that is already bound");
            log::error!("{}: already bound to a listen slot", self.name);
            return false;
        }

        match self.tcp.pool.claim(port) {
            Ok(slot) => {
                log::info!("{}: serving Modbus-TCP on port {port}", self.name);
                self.tcp.slot = Some(slot);
                self.bytes_in_buffer = 0;
                true
            }
            Err(err) => {
                log::error!("{}: cannot listen on port {port}: {err}", self.name);
                false
            }
        }
    }

    /// Drops the client, then releases the listen slot.
    pub fn tcp_close(&mut self) {
        self.tcp_disable();
        if let Some(slot) = self.tcp.slot.take() {
            if let Err(err) = self.tcp.pool.release(slot) {
                log::warn!("{}: failed to release listen slot: {err}", self.name);
            }
        }
    }

    /// Drops the connected client, if any.
    pub fn tcp_disable(&mut self) {
        self.release_client_socket();
    }

    /// Takes the assembled frame and resets the buffer for the next one.
    pub fn tcp_get_request(&mut self) -> &[u8] {
        let len = std::mem::take(&mut self.bytes_in_buffer);
        &self.frame[..len]
    }

    /// Writes `response` to the client. A failed or short write drops the
    /// connection.
    pub fn tcp_send_response(&mut self, response: &[u8]) -> bool {
        let Some(stream) = self.tcp.client.as_mut() else {
            log::debug!("{}: cannot send response: {}", self.name, PortError::NotConnected);
            return false;
        };

        let err = match stream.write(response) {
            Ok(n) if n == response.len() => return true,
            Ok(n) => PortError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write of {n}/{} bytes", response.len()),
            )),
            Err(err) => PortError::Io(err),
        };
        log::warn!("{}: dropping client after failed send: {err}", self.name);
        self.release_client_socket();
        false
    }

    /// Idle time after which the client is dropped; zero disables the check.
    pub fn set_tcp_keepalive(&mut self, keepalive: Duration) {
        self.tcp.keepalive = keepalive;
        if self.tcp.client.is_some() {
            self.refresh_keepalive();
        }
    }

    pub fn tcp_keepalive_deadline(&self) -> Option<Instant> {
        self.tcp.keepalive_deadline
    }

    pub fn tcp_is_connected(&self) -> bool {
        self.tcp.client.is_some()
    }

    pub fn tcp_slot(&self) -> Option<SlotId> {
        self.tcp.slot
    }

    pub fn listen_pool(&self) -> &Arc<ListenSocketPool> {
        &self.tcp.pool
    }

    /// Accepts clients and assembles frames until `deadline`, returning early
    /// once a frame is announced with [`EventKind::FrameReceived`].
    ///
    /// Every iteration except a delivered frame or a fresh accept ends with the
    /// keepalive check. The loop never runs past `deadline`.
    pub fn tcp_poll(&mut self, deadline: Instant) {
        loop {
            let step = self.tcp_poll_step(deadline);
            if step.runs_keepalive_check() {
                self.check_keepalive();
            }
            match step {
                Step::Continue | Step::Accepted if self.clock.now() <= deadline => {}
                _ => return,
            }
        }
    }

    fn tcp_poll_step(&mut self, deadline: Instant) -> Step {
        if let Some(stream) = &self.tcp.client {
            let ready = wait_readable(Source::Client(stream), self.clock.as_ref(), deadline);
            return match ready {
                Ok(true) => self.tcp_receive(),
                Ok(false) => Step::Return,
                Err(err) => {
                    log::debug!("{}: client wait failed: {err}", self.name);
                    Step::Return
                }
            };
        }

        let Some(slot) = self.tcp.slot else {
            self.clock.sleep_until(deadline);
            return Step::Return;
        };
        if let Err(err) = self.tcp.pool.ensure_listening(slot) {
            log::warn!("{}: listen socket still closed: {err}", self.name);
        }
        let Some(listener) = self.tcp.pool.listener(slot) else {
            // Every instance on this port has a client.
            self.clock.sleep_until(deadline);
            return Step::Return;
        };

        match wait_readable(Source::Listener(&listener), self.clock.as_ref(), deadline) {
            Ok(true) => self.tcp_accept(&listener, slot),
            Ok(false) => Step::Return,
            Err(err) => {
                log::debug!("{}: listener wait failed: {err}", self.name);
                Step::Return
            }
        }
    }

    fn tcp_accept(&mut self, listener: &TcpListener, slot: SlotId) -> Step {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            // Another instance sharing the socket took the connection.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Step::Continue,
            Err(err) => {
                log::debug!("{}: accept failed: {err}", self.name);
                return Step::Return;
            }
        };

        self.refresh_keepalive();
        if let Err(err) = self.tcp.pool.client_connected(slot) {
            log::warn!("{}: refusing {peer}: {err}", self.name);
            return Step::Return;
        }

        if let Err(err) = stream.set_nonblocking(false) {
            log::warn!("{}: cannot configure client {peer}: {err}", self.name);
            self.tcp.client = Some(stream);
            self.release_client_socket();
            return Step::Return;
        }
        if let Err(err) = stream.set_nodelay(true) {
            log::debug!("{}: cannot disable Nagle for {peer}: {err}", self.name);
        }

        log::debug!("{}: accepted client {peer}", self.name);
        self.tcp.client = Some(stream);
        self.bytes_in_buffer = 0;
        Step::Accepted
    }

    fn tcp_receive(&mut self) -> Step {
        let capacity = self.frame.len();
        let total =
            declared_frame_len(&self.frame[..self.bytes_in_buffer]).unwrap_or(MBAP_PREFIX_LEN);
        let violation = if total > capacity {
            Some(PortError::FrameTooLarge {
                declared: total,
                capacity,
            })
        } else if self.bytes_in_buffer == MBAP_PREFIX_LEN && total < MBAP_HEADER_LEN {
            // A zero length field leaves no room for the unit identifier.
            Some(PortError::Framing(0))
        } else {
            None
        };
        if let Some(err) = violation {
            log::warn!("{}: dropping client: {err}", self.name);
            self.release_client_socket();
            return Step::Continue;
        }

        let Some(stream) = self.tcp.client.as_mut() else {
            return Step::Continue;
        };
        match stream.read(&mut self.frame[self.bytes_in_buffer..total]) {
            Ok(0) => {
                log::debug!("{}: client closed the connection", self.name);
                self.release_client_socket();
                return Step::Continue;
            }
            Ok(n) => self.bytes_in_buffer += n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Step::Continue;
            }
            Err(err) => {
                log::debug!("{}: receive failed: {err}", self.name);
                self.release_client_socket();
                return Step::Continue;
            }
        }

        if total >= MBAP_HEADER_LEN && self.bytes_in_buffer == total {
            self.refresh_keepalive();
            self.event_post(EventKind::FrameReceived);
            log::debug!("{}: received {total} byte frame", self.name);
            return Step::Delivered;
        }
        Step::Continue
    }

    fn refresh_keepalive(&mut self) {
        self.tcp.keepalive_deadline = Some(self.clock.now() + self.tcp.keepalive);
    }

    fn check_keepalive(&mut self) {
        if self.tcp.client.is_none() || self.tcp.keepalive.is_zero() {
            return;
        }
        if let Some(deadline) = self.tcp.keepalive_deadline {
            if self.clock.now() >= deadline {
                log::info!(
                    "{}: client idle for {:?}, disconnecting",
                    self.name,
                    self.tcp.keepalive
                );
                self.release_client_socket();
            }
        }
    }

    /// Returns the client's capacity to the pool, discards unread input and
    /// closes the connection.
    fn release_client_socket(&mut self) {
        let Some(mut stream) = self.tcp.client.take() else {
            return;
        };

        if let Some(slot) = self.tcp.slot {
            if let Err(err) = self.tcp.pool.client_disconnected(slot) {
                log::warn!("{}: {err}", self.name);
            }
        }

        if stream.set_nonblocking(true).is_ok() {
            while matches!(stream.read(&mut self.frame), Ok(n) if n > 0) {}
        }
        drop(stream);

        self.bytes_in_buffer = 0;
        self.tcp.keepalive_deadline = None;
        log::debug!("{}: client released", self.name);
    }
}
