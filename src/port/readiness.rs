//! Bounded wait for a socket to become readable.
use std::{
    io,
    net::{TcpListener, TcpStream},
    time::{Duration, Instant},
};

use super::clock::Clock;

/// Socket the multiplexer waits on: the connected client if there is one,
/// else the slot's listen socket.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Source<'a> {
    Client(&'a TcpStream),
    Listener(&'a TcpListener),
}

/// Waits until `source` is readable or `deadline` passes.
///
/// Returns `Ok(false)` on timeout. A deadline in the past checks once without
/// blocking.
pub(crate) fn wait_readable(
    source: Source<'_>,
    clock: &dyn Clock,
    deadline: Instant,
) -> io::Result<bool> {
    imp::wait_readable(source, clock, deadline)
}

fn timeout_millis(clock: &dyn Clock, deadline: Instant) -> u128 {
    // Round up so the wait never ends before the deadline.
    let left = deadline.saturating_duration_since(clock.now());
    left.as_nanos().div_ceil(Duration::from_millis(1).as_nanos())
}

#[cfg(unix)]
mod imp {
    use std::os::fd::AsRawFd;

    use super::*;

    pub(super) fn wait_readable(
        source: Source<'_>,
        clock: &dyn Clock,
        deadline: Instant,
    ) -> io::Result<bool> {
        let fd = match source {
            Source::Client(stream) => stream.as_raw_fd(),
            Source::Listener(listener) => listener.as_raw_fd(),
        };

        loop {
            let timeout = i32::try_from(timeout_millis(clock, deadline)).unwrap_or(i32::MAX);
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: `pfd` is a valid pollfd for the duration of the call and
            // `fd` is kept open by the borrowed socket.
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc > 0);
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::os::windows::io::AsRawSocket;

    use windows::Win32::Networking::WinSock::{
        WSAPoll, POLLRDNORM, SOCKET, WSAPOLLFD, WSAPOLL_EVENT_FLAGS,
    };

    use super::*;

    pub(super) fn wait_readable(
        source: Source<'_>,
        clock: &dyn Clock,
        deadline: Instant,
    ) -> io::Result<bool> {
        let raw = match source {
            Source::Client(stream) => stream.as_raw_socket(),
            Source::Listener(listener) => listener.as_raw_socket(),
        };

        let timeout = i32::try_from(timeout_millis(clock, deadline)).unwrap_or(i32::MAX);
        let mut pfd = WSAPOLLFD {
            fd: SOCKET(raw as usize),
            events: POLLRDNORM,
            revents: WSAPOLL_EVENT_FLAGS(0),
        };
        // SAFETY: `pfd` is a valid WSAPOLLFD for the duration of the call and
        // the socket is kept open by the borrowed handle.
        let rc = unsafe { WSAPoll(&mut pfd, 1, timeout) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc > 0)
    }
}
