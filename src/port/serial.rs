use serde::{Deserialize, Serialize};
use serialport::{DataBits, SerialPort, StopBits};
use std::{
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use super::{engine::EngineCallbacks, instance::Instance};
use crate::error::{PortError, Result};

/// Direction the serial transport currently works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerialMode {
    #[default]
    Disabled,
    Receiver,
    Transmitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Line settings requested by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
}

impl SerialSettings {
    pub fn apply_builder(&self, b: serialport::SerialPortBuilder) -> serialport::SerialPortBuilder {
        let b = b.data_bits(match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        });
        let b = b.stop_bits(StopBits::One);
        b.parity(self.parity.into())
    }
}

/// Byte-level serial driver the transport reads from and writes to.
pub trait SerialDevice: Send {
    fn open(&mut self, settings: &SerialSettings) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Reads whatever is available, waiting no later than `deadline`.
    fn read_until(&mut self, deadline: Instant, buffer: &mut [u8]) -> io::Result<usize>;

    /// Writes `buffer`, giving up at `deadline`. Returns the bytes written.
    fn write_until(&mut self, deadline: Instant, buffer: &[u8]) -> io::Result<usize>;
}

/// [`SerialDevice`] backed by a `serialport` handle.
pub struct SerialPortDevice {
    path: String,
    handle: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for SerialPortDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortDevice")
            .field("path", &self.path)
            .field("open", &self.handle.is_some())
            .finish()
    }
}

impl SerialPortDevice {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            handle: None,
        }
    }

    fn handle(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

impl SerialDevice for SerialPortDevice {
    fn open(&mut self, settings: &SerialSettings) -> Result<()> {
        let builder = serialport::new(self.path.as_str(), settings.baud_rate)
            .timeout(Duration::from_millis(100));
        let builder = settings.apply_builder(builder);

        #[cfg(unix)]
        let handle: Box<dyn SerialPort> = {
            let mut native = builder.open_native()?;
            native.set_exclusive(true)?;
            Box::new(native)
        };
        #[cfg(not(unix))]
        let handle = builder.open()?;

        log::info!(
            "Opened serial port {} at {} baud ({} data bits, parity {:?})",
            self.path,
            settings.baud_rate,
            settings.data_bits,
            settings.parity
        );
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            log::info!("Closed serial port {}", self.path);
        }
        Ok(())
    }

    fn read_until(&mut self, deadline: Instant, buffer: &mut [u8]) -> io::Result<usize> {
        let handle = self.handle()?;
        handle.set_timeout(remaining(deadline))?;
        handle.read(buffer)
    }

    fn write_until(&mut self, deadline: Instant, buffer: &[u8]) -> io::Result<usize> {
        let handle = self.handle()?;
        let mut written = 0;
        while written < buffer.len() {
            let left = remaining(deadline);
            if left.is_zero() {
                break;
            }
            handle.set_timeout(left)?;
            match handle.write(&buffer[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        handle.flush()?;
        Ok(written)
    }
}

impl Instance {
    /// Opens the serial device with the engine's line settings.
    pub fn serial_init(&mut self, baud_rate: u32, data_bits: u8, parity: Parity) -> bool {
        let settings = SerialSettings {
            baud_rate,
            data_bits,
            parity,
        };
        let Some(device) = self.serial.device.as_mut() else {
            log::error!("{}: no serial device attached", self.name);
            return false;
        };
        match device.open(&settings) {
            Ok(()) => true,
            Err(err) => {
                log::error!("{}: failed to open serial device: {err}", self.name);
                false
            }
        }
    }

    /// Switches the transport direction. At most one of `rx`/`tx` may be set.
    pub fn serial_enable(&mut self, rx: bool, tx: bool) {
        debug_assert!(!(rx && tx), "receiver and transmitter enabled together");

        self.serial.mode = if rx {
            SerialMode::Receiver
        } else if tx {
            SerialMode::Transmitter
        } else {
            SerialMode::Disabled
        };

        if rx {
            self.rx_position = 0;
        }
        if tx {
            self.tx_position = 0;
        }
    }

    pub fn serial_mode(&self) -> SerialMode {
        self.serial.mode
    }

    /// Next received byte, `None` once the received chunk is consumed.
    pub fn serial_get_byte(&mut self) -> Option<u8> {
        if self.rx_position >= self.bytes_in_buffer {
            return None;
        }
        let byte = self.frame[self.rx_position];
        self.rx_position += 1;
        Some(byte)
    }

    /// Appends one byte to the outgoing frame. Fails once the buffer is full.
    pub fn serial_put_byte(&mut self, byte: u8) -> bool {
        if self.tx_position >= self.frame.len() {
            return false;
        }
        self.frame[self.tx_position] = byte;
        self.tx_position += 1;
        true
    }

    pub fn serial_close(&mut self) {
        self.timer_close();
        self.serial.mode = SerialMode::Disabled;
        if let Some(device) = self.serial.device.as_mut() {
            if let Err(err) = device.close() {
                log::warn!("{}: failed to close serial device: {err}", self.name);
            }
        }
    }

    /// Moves bytes between the device and the engine until `deadline`.
    ///
    /// In receiver mode every read chunk is handed to the engine byte by byte
    /// until a read fails, returns nothing, or the engine leaves receiver
    /// mode. In transmitter mode the engine fills the buffer through
    /// [`EngineCallbacks::transmitter_empty`], then the frame is written once.
    pub fn serial_poll<E: EngineCallbacks + ?Sized>(&mut self, engine: &mut E, deadline: Instant) {
        if self.serial.device.is_none() {
            log::debug!("{}: serial poll without a device", self.name);
            self.clock.sleep_until(deadline);
            return;
        }

        while self.serial.mode == SerialMode::Receiver {
            let Some(device) = self.serial.device.as_mut() else {
                return;
            };
            let received = match device.read_until(deadline, &mut self.frame) {
                Ok(0) => return,
                Ok(n) => n,
                Err(err) => {
                    if err.kind() != io::ErrorKind::TimedOut {
                        log::debug!("{}: serial read failed: {err}", self.name);
                    }
                    return;
                }
            };

            self.bytes_in_buffer = received;
            self.rx_position = 0;
            for _ in 0..received {
                engine.byte_received(self);
            }
        }

        if self.serial.mode == SerialMode::Transmitter {
            while self.serial.mode == SerialMode::Transmitter {
                engine.transmitter_empty(self);
            }

            let Some(device) = self.serial.device.as_mut() else {
                return;
            };
            let pending = self.tx_position;
            match device.write_until(deadline, &self.frame[..pending]) {
                Ok(n) if n == pending => {}
                Ok(n) => log::warn!("{}: serial write cut short at {n}/{pending} bytes", self.name),
                Err(err) => {
                    log::warn!("{}: serial write failed: {}", self.name, PortError::from(err))
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{mock::MockSerial, *};
    use crate::port::{
        clock::{Clock, ManualClock},
        instance::{InstanceBuilder, TransportMode},
    };

    /// Collects received bytes and leaves receiver mode after `stop_after`.
    struct Collector {
        bytes: Vec<u8>,
        stop_after: usize,
        reply: Vec<u8>,
        sent: usize,
    }

    impl EngineCallbacks for Collector {
        fn byte_received(&mut self, port: &mut Instance) {
            if let Some(byte) = port.serial_get_byte() {
                self.bytes.push(byte);
            }
            if self.bytes.len() == self.stop_after {
                port.serial_enable(false, false);
            }
        }

        fn transmitter_empty(&mut self, port: &mut Instance) {
            match self.reply.get(self.sent) {
                Some(&byte) => {
                    assert!(port.serial_put_byte(byte));
                    self.sent += 1;
                }
                None => port.serial_enable(true, false),
            }
        }
    }

    fn collector(stop_after: usize) -> Collector {
        Collector {
            bytes: Vec::new(),
            stop_after,
            reply: Vec::new(),
            sent: 0,
        }
    }

    fn instance(device: MockSerial) -> Instance {
        InstanceBuilder::new(TransportMode::Rtu)
            .with_clock(Arc::new(ManualClock::new()))
            .with_serial(Box::new(device))
            .build()
    }

    #[test]
    fn receiver_feeds_every_byte_until_read_times_out() {
        let device = MockSerial::default();
        device.push_read(&[1, 2, 3]);
        device.push_read(&[4]);
        let mut port = instance(device);
        let mut engine = collector(usize::MAX);

        port.serial_enable(true, false);
        let deadline = port.clock().now();
        port.serial_poll(&mut engine, deadline);

        assert_eq!(engine.bytes, vec![1, 2, 3, 4]);
        assert_eq!(port.serial_mode(), SerialMode::Receiver);
    }

    #[test]
    fn receiver_stops_when_engine_leaves_receiver_mode() {
        let device = MockSerial::default();
        device.push_read(&[9, 8]);
        device.push_read(&[7]);
        let reads = device.reads.clone();
        let mut port = instance(device);
        let mut engine = collector(2);

        port.serial_enable(true, false);
        let deadline = port.clock().now();
        port.serial_poll(&mut engine, deadline);

        assert_eq!(engine.bytes, vec![9, 8]);
        assert_eq!(reads.lock().len(), 1);
    }

    #[test]
    fn zero_byte_read_ends_the_poll() {
        let device = MockSerial::default();
        device.push_read(&[]);
        device.push_read(&[5]);
        let mut port = instance(device);
        let mut engine = collector(usize::MAX);

        port.serial_enable(true, false);
        let deadline = port.clock().now();
        port.serial_poll(&mut engine, deadline);
        assert!(engine.bytes.is_empty());
    }

    #[test]
    fn transmitter_collects_bytes_then_writes_once() {
        let device = MockSerial::default();
        let written = device.written.clone();
        let mut port = instance(device);
        let mut engine = collector(usize::MAX);
        engine.reply = vec![0x11, 0x03, 0x00];

        port.serial_enable(false, true);
        let deadline = port.clock().now();
        port.serial_poll(&mut engine, deadline);

        assert_eq!(written.lock().as_slice(), &[vec![0x11, 0x03, 0x00]]);
        assert_eq!(port.serial_mode(), SerialMode::Receiver);
    }

    #[test]
    fn byte_accessors_respect_cursors() {
        let mut port = instance(MockSerial::default());
        assert_eq!(port.serial_get_byte(), None);

        port.serial_enable(false, true);
        let capacity = port.frame_capacity();
        for i in 0..capacity {
            assert!(port.serial_put_byte(i as u8));
        }
        assert!(!port.serial_put_byte(0xff));

        port.serial_enable(true, false);
        assert_eq!(port.serial_get_byte(), None);
    }

    #[test]
    fn init_and_close_drive_the_device() {
        let device = MockSerial::default();
        let opened = device.opened.clone();
        let mut port = instance(device);

        assert!(port.serial_init(19_200, 8, Parity::Even));
        assert_eq!(
            *opened.lock(),
            Some(SerialSettings {
                baud_rate: 19_200,
                data_bits: 8,
                parity: Parity::Even
            })
        );

        port.timer_init(20);
        port.timer_enable();
        port.serial_enable(true, false);
        port.serial_close();
        assert_eq!(*opened.lock(), None);
        assert_eq!(port.serial_mode(), SerialMode::Disabled);
        assert!(!port.timer().is_armed());
    }
}
