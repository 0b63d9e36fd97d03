//! Modbus slave engine driving an [`Instance`] through the port API.
//!
//! Requests are decoded and answered with `rmodbus` against a register
//! storage that may be shared by several instances.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rmodbus::{
    server::{storage::ModbusStorageSmall, ModbusFrame},
    ModbusProto,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::port::{
    instance::MAX_SERIAL_FRAME, EngineCallbacks, EventKind, Instance, SerialMode, TransportMode,
};

pub type SharedStorage = Arc<Mutex<ModbusStorageSmall>>;

/// Inter-frame silence for RTU in 50 µs timer units: 3.5 character times,
/// fixed at 1750 µs above 19200 baud.
pub fn rtu_t35_units(baud_rate: u32) -> u16 {
    if baud_rate == 0 || baud_rate > 19_200 {
        35
    } else {
        u16::try_from((7 * 220_000) / (2 * baud_rate)).unwrap_or(u16::MAX)
    }
}

pub struct ModbusServer {
    unit_id: u8,
    baud_rate: u32,
    storage: SharedStorage,
    request: Vec<u8>,
    response: Vec<u8>,
    sent: usize,
}

impl ModbusServer {
    pub fn new(unit_id: u8, storage: SharedStorage) -> Self {
        Self {
            unit_id,
            baud_rate: 19_200,
            storage,
            request: Vec::with_capacity(MAX_SERIAL_FRAME),
            response: Vec::new(),
            sent: 0,
        }
    }

    /// Line speed used to derive the RTU inter-frame timeout.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Prepares the instance's transport and queues [`EventKind::Ready`].
    pub fn start(&mut self, port: &mut Instance) -> Result<()> {
        match port.mode() {
            TransportMode::Ascii => {
                return Err(anyhow!(
                    "{}: ASCII framing is not supported by this server",
                    port.name()
                ))
            }
            TransportMode::Rtu => {
                port.timer_init(rtu_t35_units(self.baud_rate));
                port.serial_enable(true, false);
            }
            TransportMode::Tcp => {
                if port.tcp_slot().is_none() {
                    return Err(anyhow!("{}: TCP instance is not bound to a port", port.name()));
                }
            }
        }

        self.request.clear();
        port.event_init();
        port.event_post(EventKind::Ready);
        Ok(())
    }

    /// Serves requests until `stop` is raised, then releases the transport.
    pub fn run(&mut self, port: &mut Instance, stop: &AtomicBool) -> Result<()> {
        self.start(port)?;
        while !stop.load(Ordering::Relaxed) {
            if let Some(event) = port.event_get(self) {
                self.handle(port, event);
            }
        }

        log::info!("{}: stopping", port.name());
        match port.mode() {
            TransportMode::Tcp => port.tcp_close(),
            TransportMode::Rtu | TransportMode::Ascii => port.serial_close(),
        }
        Ok(())
    }

    pub fn handle(&mut self, port: &mut Instance, event: EventKind) {
        match event {
            EventKind::Ready => log::info!("{}: ready (unit {})", port.name(), self.unit_id),
            EventKind::FrameReceived => {
                match port.mode() {
                    TransportMode::Tcp => {
                        self.request.clear();
                        self.request.extend_from_slice(port.tcp_get_request());
                    }
                    TransportMode::Rtu | TransportMode::Ascii => {
                        port.serial_enable(false, false);
                        port.timer_disable();
                    }
                }
                port.event_post(EventKind::Execute);
            }
            EventKind::Execute => {
                let response = self.execute(port.mode());
                self.request.clear();
                match (port.mode(), response) {
                    (TransportMode::Tcp, Some(response)) => {
                        port.tcp_send_response(&response);
                    }
                    (TransportMode::Tcp, None) => {}
                    (_, Some(response)) => {
                        self.response = response;
                        self.sent = 0;
                        port.serial_enable(false, true);
                    }
                    (_, None) => port.serial_enable(true, false),
                }
            }
            EventKind::FrameSent => port.serial_enable(true, false),
        }
    }

    fn execute(&mut self, mode: TransportMode) -> Option<Vec<u8>> {
        let proto = match mode {
            TransportMode::Tcp => ModbusProto::TcpUdp,
            TransportMode::Rtu => ModbusProto::Rtu,
            TransportMode::Ascii => ModbusProto::Ascii,
        };

        let mut response = Vec::new();
        {
            let mut frame = ModbusFrame::new(self.unit_id, &self.request, proto, &mut response);
            if let Err(err) = frame.parse() {
                log::debug!("Ignoring malformed request {:02x?}: {err:?}", self.request);
                return None;
            }

            if frame.processing_required {
                let mut storage = self.storage.lock();
                let result = if frame.readonly {
                    frame.process_read(&mut *storage)
                } else {
                    frame.process_write(&mut *storage)
                };
                if let Err(err) = result {
                    log::debug!("Request processing failed: {err:?}");
                }
            }

            if !frame.response_required {
                return None;
            }
            if let Err(err) = frame.finalize_response() {
                log::warn!("Failed to finalize response: {err:?}");
                return None;
            }
        }

        log::debug!("Send Modbus response: {response:02x?}");
        Some(response)
    }
}

impl EngineCallbacks for ModbusServer {
    fn byte_received(&mut self, port: &mut Instance) {
        if let Some(byte) = port.serial_get_byte() {
            if self.request.len() < MAX_SERIAL_FRAME {
                self.request.push(byte);
            }
        }
        port.timer_enable();
    }

    fn transmitter_empty(&mut self, port: &mut Instance) {
        match self.response.get(self.sent) {
            Some(&byte) if port.serial_put_byte(byte) => self.sent += 1,
            Some(_) => {
                log::warn!("{}: response does not fit the frame buffer", port.name());
                port.serial_enable(false, false);
            }
            None => {
                port.serial_enable(false, false);
                port.event_post(EventKind::FrameSent);
            }
        }
    }

    fn timer_expired(&mut self, port: &mut Instance) {
        if port.serial_mode() == SerialMode::Receiver && !self.request.is_empty() {
            port.event_post(EventKind::FrameReceived);
        }
    }
}
