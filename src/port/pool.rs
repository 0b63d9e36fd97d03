//! Shared pool of Modbus-TCP listen sockets.
//!
//! Several instances may serve the same TCP port. They share one pool slot,
//! and therefore one OS listen socket, which is reference counted twice:
//! `bind_counter` counts the instances bound to the port (the number of
//! clients the port may serve at once), `client_counter` counts the clients
//! currently connected through it. The listen socket is open exactly while
//! `client_counter < bind_counter`, so the port never accepts more clients
//! than there are idle instances.
//!
//! Every inspect-and-mutate step happens under the pool's single mutex. The
//! mutex is never held while waiting for readiness; the multiplexer clones
//! the listener handle out of the slot and waits on it unlocked.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    fmt,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener},
    sync::Arc,
};

use crate::error::{PortError, Result};

/// Opens the OS listen socket of a slot.
pub trait ListenerOpener: Send + Sync {
    /// Opens a non-blocking listener on `port`; `0` asks for an ephemeral port.
    fn open(&self, port: u16) -> io::Result<TcpListener>;
}

/// Backlog of listen sockets opened by [`SocketListenerOpener::default`].
pub const DEFAULT_LISTEN_BACKLOG: i32 = 16;

/// Opens address-reusing listeners on `address` with a fixed `backlog`.
#[derive(Debug, Clone, Copy)]
pub struct SocketListenerOpener {
    pub address: IpAddr,
    pub backlog: i32,
}

impl Default for SocketListenerOpener {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }
}

impl ListenerOpener for SocketListenerOpener {
    fn open(&self, port: u16) -> io::Result<TcpListener> {
        let address = SocketAddr::new(self.address, port);
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&address.into())?;
        socket.listen(self.backlog)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }
}

/// Index of a slot inside its [`ListenSocketPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

/// Point-in-time view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    pub port: Option<u16>,
    pub bind_counter: usize,
    pub client_counter: usize,
    pub listening: bool,
}

/// One shareable listen socket.
#[derive(Default)]
pub struct ListenSocket {
    port: Option<u16>,
    bind_counter: usize,
    client_counter: usize,
    socket: Option<Arc<TcpListener>>,
}

impl fmt::Debug for ListenSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenSocket")
            .field("port", &self.port)
            .field("bind_counter", &self.bind_counter)
            .field("client_counter", &self.client_counter)
            .field("listening", &self.socket.is_some())
            .finish()
    }
}

impl ListenSocket {
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn socket(&self) -> Option<&Arc<TcpListener>> {
        self.socket.as_ref()
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus {
            port: self.port,
            bind_counter: self.bind_counter,
            client_counter: self.client_counter,
            listening: self.socket.is_some(),
        }
    }

    fn open_socket(&mut self, opener: &dyn ListenerOpener, port: u16) -> Result<()> {
        let listener = opener.open(port)?;
        let assigned = listener.local_addr()?.port();
        log::debug!("Listen socket open on port {assigned}");
        self.socket = Some(Arc::new(listener));
        self.port = Some(assigned);
        Ok(())
    }

    fn close_socket(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("Listen socket closed on port {:?}", self.port);
        }
    }

    /// Adds one bound instance, opening the socket if it is not open yet.
    pub fn bind(&mut self, opener: &dyn ListenerOpener, port: u16) -> Result<()> {
        if let Some(bound) = self.port {
            if self.bind_counter > 0 && bound != port {
                return Err(PortError::Busy {
                    bound,
                    requested: port,
                });
            }
        }

        if self.socket.is_none() {
            let port = self.port.unwrap_or(port);
            self.open_socket(opener, port)?;
        }

        self.bind_counter += 1;
        Ok(())
    }

    /// Records an accepted client. The socket closes once every bound
    /// instance has a client.
    pub fn client_connected(&mut self) -> Result<()> {
        if self.client_counter >= self.bind_counter {
            return Err(PortError::PoolExhausted {
                clients: self.client_counter,
                binds: self.bind_counter,
            });
        }

        if self.client_counter + 1 == self.bind_counter {
            self.close_socket();
        }

        self.client_counter += 1;
        Ok(())
    }

    /// Records a dropped client, reopening the socket if it was closed for
    /// lack of capacity. The counter drops even when the reopen fails.
    pub fn client_disconnected(&mut self, opener: &dyn ListenerOpener) -> Result<()> {
        if self.client_counter == 0 {
            debug_assert!(false, "client disconnected without a connected client");
            return Err(PortError::IllegalState(
                "client disconnected without a connected client",
            ));
        }

        let reopen = if self.client_counter == self.bind_counter && self.socket.is_none() {
            match self.port {
                Some(port) => self.open_socket(opener, port),
                None => Err(PortError::IllegalState("connected slot has no port")),
            }
        } else {
            Ok(())
        };

        self.client_counter -= 1;
        reopen
    }

    /// Removes one bound instance; the last one releases the port.
    pub fn unbind(&mut self) -> Result<()> {
        if self.bind_counter == 0 || self.client_counter >= self.bind_counter {
            debug_assert!(false, "unbind of a slot without an idle binding");
            return Err(PortError::IllegalState(
                "unbind of a slot without an idle binding",
            ));
        }

        if self.client_counter + 1 >= self.bind_counter || self.bind_counter == 1 {
            self.close_socket();
        }

        self.bind_counter -= 1;
        if self.bind_counter == 0 {
            self.port = None;
        }
        Ok(())
    }

    /// Reopens the socket when there is capacity but no socket, which only
    /// happens after a failed reopen in [`ListenSocket::client_disconnected`].
    fn ensure_listening(&mut self, opener: &dyn ListenerOpener) -> Result<()> {
        match self.port {
            Some(port) if self.socket.is_none() && self.client_counter < self.bind_counter => {
                self.open_socket(opener, port)
            }
            _ => Ok(()),
        }
    }
}

/// Fixed-size set of [`ListenSocket`]s shared by all instances.
pub struct ListenSocketPool {
    slots: Mutex<Vec<ListenSocket>>,
    opener: Box<dyn ListenerOpener>,
}

impl fmt::Debug for ListenSocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenSocketPool")
            .field("slots", &*self.slots.lock())
            .finish_non_exhaustive()
    }
}

impl ListenSocketPool {
    pub fn new(slots: usize) -> Self {
        Self::with_opener(slots, SocketListenerOpener::default())
    }

    /// Pool whose listen sockets queue at most `backlog` pending connections.
    pub fn with_backlog(slots: usize, backlog: i32) -> Self {
        Self::with_opener(
            slots,
            SocketListenerOpener {
                backlog,
                ..SocketListenerOpener::default()
            },
        )
    }

    pub fn with_opener(slots: usize, opener: impl ListenerOpener + 'static) -> Self {
        Self {
            slots: Mutex::new((0..slots).map(|_| ListenSocket::default()).collect()),
            opener: Box::new(opener),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_slot<T>(
        &self,
        slot: SlotId,
        f: impl FnOnce(&mut ListenSocket, &dyn ListenerOpener) -> Result<T>,
    ) -> Result<T> {
        let mut slots = self.slots.lock();
        let socket = slots
            .get_mut(slot.0)
            .ok_or(PortError::IllegalState("slot does not belong to this pool"))?;
        f(socket, self.opener.as_ref())
    }

    /// Binds `port` on the slot already serving it, or on the first unbound
    /// slot.
    pub fn claim(&self, port: u16) -> Result<SlotId> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|s| port != 0 && s.port == Some(port))
            .or_else(|| slots.iter().position(|s| s.port.is_none()))
            .ok_or(PortError::NoFreeSlot(port))?;

        slots[index].bind(self.opener.as_ref(), port)?;
        log::info!(
            "Bound port {:?} on listen slot {index} ({} instance(s))",
            slots[index].port,
            slots[index].bind_counter
        );
        Ok(SlotId(index))
    }

    pub fn release(&self, slot: SlotId) -> Result<()> {
        self.with_slot(slot, |socket, _| {
            socket.unbind()?;
            log::info!(
                "Unbound listen slot {} ({} instance(s) left)",
                slot.0,
                socket.bind_counter
            );
            Ok(())
        })
    }

    pub fn client_connected(&self, slot: SlotId) -> Result<()> {
        self.with_slot(slot, |socket, _| socket.client_connected())
    }

    pub fn client_disconnected(&self, slot: SlotId) -> Result<()> {
        self.with_slot(slot, |socket, opener| socket.client_disconnected(opener))
    }

    pub fn ensure_listening(&self, slot: SlotId) -> Result<()> {
        self.with_slot(slot, |socket, opener| socket.ensure_listening(opener))
    }

    /// Handle to the slot's listen socket, if it is open.
    pub fn listener(&self, slot: SlotId) -> Option<Arc<TcpListener>> {
        self.with_slot(slot, |socket, _| Ok(socket.socket.clone()))
            .ok()
            .flatten()
    }

    pub fn status(&self, slot: SlotId) -> Option<SlotStatus> {
        self.with_slot(slot, |socket, _| Ok(socket.status())).ok()
    }
}
