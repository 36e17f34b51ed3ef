//! Session/protocol driver and streaming bridge for a BITalino-class biosignal
//! acquisition device, reachable over Bluetooth RFCOMM or serial.
//!
//! # Timing and Synchronization
//!
//! The device samples at a precise rate controlled by its internal crystal.
//! However, Bluetooth introduces variable latency. For accurate timing
//! reconstruction:
//!
//! 1. Record the start time when calling [`Session::start`].
//! 2. Use [`codec::Sample::seq`] to detect dropped frames.
//! 3. Calculate sample times as: `start_time + sample_index / sampling_rate`.

pub mod bluetooth;
pub mod bridge;
pub mod codec;
pub mod errors;
pub mod logging;
pub mod session;
pub mod streamer;
pub mod transport;

pub use bluetooth::{BluetoothConnector, RfcommStream};
pub use bridge::{Bridge, BridgeConfig, BroadcastSink};
pub use errors::{BluetoothError, DriverError, Result};
pub use session::{HardwareVersion, Session, SessionState};
pub use streamer::{NullSink, Sink, Streamer};
pub use transport::{DeviceAddress, SerialTransport, Transport, TransportKind};

/// Default pairing PIN for devices that have not been paired out-of-band.
/// BITalino ships with this as its factory default.
const DEFAULT_PAIRING_PIN: &str = "1234";

/// Open a [`Transport`] for `address`, dispatching to Bluetooth RFCOMM or
/// serial depending on how it was classified by [`DeviceAddress::parse`].
pub fn open_transport(address: &DeviceAddress) -> Result<Box<dyn Transport>> {
    match address {
        DeviceAddress::Mac(mac) => {
            let connector = BluetoothConnector::default();
            let transport =
                transport::RfcommTransport::connect(&connector, mac, DEFAULT_PAIRING_PIN)?;
            Ok(Box::new(transport))
        }
        DeviceAddress::SerialPort(path) => Ok(Box::new(SerialTransport::open(path)?)),
    }
}
