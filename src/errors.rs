//! Error types surfaced by the sensor driver, split between transport, session and
//! Bluetooth concerns.
use std::io;
use thiserror::Error;

/// Top-level driver errors surfaced to callers.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    /// I/O failures from stdlib operations.
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    /// Serial-port layer errors.
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    /// Bluetooth-related issues (pairing/connectivity).
    Bluetooth(#[from] BluetoothError),
    #[error("timeout: {0}")]
    /// Operations that exceeded their allotted time budget.
    Timeout(String),
    #[error("command failed: {0}")]
    /// Device commands that returned an error.
    Command(String),
    #[error("invalid address: {0}")]
    /// `DeviceAddress` failed MAC/serial-path validation.
    InvalidAddress(String),
    #[error("bluetooth is not supported on this platform")]
    /// A Bluetooth address was given on a platform that cannot open RFCOMM sockets.
    InvalidPlatform,
    #[error("invalid parameter: {0}")]
    /// Out-of-domain rate, mask, threshold, PWM value, or trigger vector.
    InvalidParameter(String),
    #[error("device is not idle")]
    /// Operation requires `Idle` but the session is in some other state.
    NotIdle,
    #[error("device is not acquiring")]
    /// Operation requires `Acquiring` but the session is in some other state.
    NotAcquiring,
    #[error("operation requires BITalino 2.0+ hardware")]
    /// A v2-only operation was requested on v1 hardware.
    InvalidVersion,
    #[error("lost communication with the device: {0}")]
    /// CRC failure, short read, or timeout while expecting frame bytes.
    ContactingDevice(String),
    #[error("bluetooth backend unavailable: {0}")]
    /// The Bluetooth backend could not be loaded at runtime on a supported platform.
    ImportFailed(String),
}

/// Bluetooth-specific failures separated from transport and protocol issues.
#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found during scan: {mac}")]
    /// Adapter scan failed to discover the requested MAC address.
    NotFound { mac: String },
    #[error("pairing failed: {0}")]
    /// Pairing handshake failed.
    Pairing(String),
    #[error("connection not established: {0}")]
    /// RFCOMM connection was not established.
    NotConnected(String),
    #[error("rfcomm connection failed: {0}")]
    /// Low-level RFCOMM socket errors.
    Connection(String),
}

/// Convenience result alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
