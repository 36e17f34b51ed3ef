//! Byte-pipe abstraction over the sensor's two physical links.
//!
//! A `Transport` never interprets the bytes it moves — framing, CRCs and command
//! encoding all live in [`crate::codec`]. This module only answers "how do I get
//! bytes on and off the wire", for either an RFCOMM socket or a serial port.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::debug;

use crate::bluetooth::{BluetoothConnector, RfcommStream};
use crate::errors::{DriverError, Result};

/// Serial baud rate the sensor expects (115200, 8N1).
pub const BAUD_RATE: u32 = 115200;

/// Default timeout applied when opening a serial port.
const SERIAL_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// A validated, tagged device address (§4.2).
///
/// No other component accepts a raw address string; constructing one of these
/// is the only way to open a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAddress {
    /// A Bluetooth MAC address, e.g. `98:D3:51:FE:6F:A3`.
    Mac(String),
    /// A platform-native serial device path, e.g. `/dev/rfcomm0` or `COM3`.
    SerialPort(String),
}

/// Which physical link a [`DeviceAddress`] resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Bluetooth,
    Serial,
}

impl DeviceAddress {
    /// Validate and classify a raw address string per §4.2.
    ///
    /// MAC form: six hex pairs separated uniformly by `:` or `-`.
    /// Path form: begins with `COM` on Windows, or `/dev/` elsewhere.
    pub fn parse(raw: &str) -> Result<Self> {
        if is_mac_address(raw) {
            return Ok(DeviceAddress::Mac(raw.to_string()));
        }

        let is_path = if cfg!(windows) {
            raw.starts_with("COM")
        } else {
            raw.starts_with("/dev/")
        };

        if is_path {
            Ok(DeviceAddress::SerialPort(raw.to_string()))
        } else {
            Err(DriverError::InvalidAddress(raw.to_string()))
        }
    }

    /// The transport kind this address resolves to.
    pub fn kind(&self) -> TransportKind {
        match self {
            DeviceAddress::Mac(_) => TransportKind::Bluetooth,
            DeviceAddress::SerialPort(_) => TransportKind::Serial,
        }
    }
}

/// Six hex pairs joined by a single, consistent separator (`:` or `-`).
fn is_mac_address(raw: &str) -> bool {
    let sep = match raw.as_bytes().get(2) {
        Some(b':') => ':',
        Some(b'-') => '-',
        _ => return false,
    };

    let parts: Vec<&str> = raw.split(sep).collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Uniform byte pipe over either transport kind (§4.2).
pub trait Transport: Send {
    /// Block until the OS has accepted the byte for transmission.
    fn write_byte(&mut self, byte: u8) -> Result<()>;

    /// Read exactly `n` bytes, optionally bounded by `deadline`.
    ///
    /// With no deadline, blocks indefinitely. On timeout, returns
    /// [`DriverError::Timeout`]; on a closed/dropped link, [`DriverError::Bluetooth`]
    /// or [`DriverError::Io`] depending on the transport.
    fn read_exact(&mut self, n: usize, deadline: Option<Instant>) -> Result<Vec<u8>>;

    /// Idempotent close.
    fn close(&mut self) -> Result<()>;
}

/// RFCOMM-backed transport, wrapping an already-connected [`RfcommStream`].
pub struct RfcommTransport {
    stream: Option<RfcommStream>,
}

impl RfcommTransport {
    pub fn new(stream: RfcommStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// Pair (if needed) and connect to `mac`, returning a ready transport.
    pub fn connect(connector: &BluetoothConnector, mac: &str, pin: &str) -> Result<Self> {
        let stream = connector.pair_and_connect(mac, pin)?;
        Ok(Self::new(stream))
    }
}

impl Transport for RfcommTransport {
    fn write_byte(&mut self, byte: u8) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DriverError::Command("transport closed".into()))?;
        stream.write_all(&[byte])?;
        stream.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, n: usize, deadline: Option<Instant>) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DriverError::Command("transport closed".into()))?;
        read_exact_with_deadline(stream, n, deadline)
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }
}

/// Serial-port-backed transport at [`BAUD_RATE`].
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    /// Open the serial port at [`BAUD_RATE`], 8N1.
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(SERIAL_OPEN_TIMEOUT)
            .open()?;
        debug!("opened serial transport: path={path}");
        Ok(Self { port: Some(port) })
    }
}

impl Transport for SerialTransport {
    fn write_byte(&mut self, byte: u8) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| DriverError::Command("transport closed".into()))?;
        port.write_all(&[byte])?;
        port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, n: usize, deadline: Option<Instant>) -> Result<Vec<u8>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| DriverError::Command("transport closed".into()))?;
        read_exact_with_deadline(port, n, deadline)
    }

    fn close(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }
}

/// Shared read loop for any `Read` byte source: accumulate up to `n` bytes,
/// polling short reads until either the buffer fills or `deadline` passes.
fn read_exact_with_deadline<R: Read>(
    reader: &mut R,
    n: usize,
    deadline: Option<Instant>,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0usize;

    while filled < n {
        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                return Err(DriverError::Timeout(format!(
                    "read_exact timed out after {filled}/{n} bytes"
                )));
            }
        }

        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(DriverError::ContactingDevice(
                    "transport closed mid-read".into(),
                ))
            }
            Ok(read) => filled += read,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if deadline.is_some() {
                    continue;
                }
                return Err(DriverError::Timeout(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(buf)
}
