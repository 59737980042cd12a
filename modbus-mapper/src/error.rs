//! Error types for the Modbus mapper.

use std::time::Duration;

use thiserror::Error;

use mapper_framework::MapperError;

use crate::codec::CodecError;
use crate::transport::RegisterBank;

/// Device profile errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read device profile: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse device profile: {0}")]
    Parse(#[from] json5::Error),

    #[error("Duplicate device id '{0}'")]
    DuplicateDevice(String),

    #[error("Device '{device}': unknown protocol '{protocol}'")]
    UnknownProtocol { device: String, protocol: String },

    #[error("Device '{device}': unknown model '{model}'")]
    UnknownModel { device: String, model: String },

    #[error("Device '{device}': twin '{twin}' has no property visitor")]
    MissingVisitor { device: String, twin: String },

    #[error("Device '{device}': property '{property}' is not declared by model '{model}'")]
    UndeclaredProperty {
        device: String,
        property: String,
        model: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Failure to open a transport client. The device is skipped.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("No protocol found: neither a serial port nor an IP address is configured")]
    NoTransport,

    #[error("Invalid address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    #[error("Serial open failed: {0}")]
    Serial(String),

    #[error("Connection failed: {0}")]
    Connect(String),
}

/// Failure of a single register operation.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Modbus exception: {0}")]
    Exception(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0} is not writable")]
    NotWritable(RegisterBank),

    #[error("Reconnect failed: {0}")]
    Reconnect(#[from] ConnectionError),

    #[error("Client closed")]
    Closed,
}

impl IoError {
    /// Whether the link should be considered broken after this error.
    ///
    /// A Modbus exception is an answer from the device, so the link is fine.
    pub fn is_link_failure(&self) -> bool {
        !matches!(self, IoError::Exception(_) | IoError::NotWritable(_))
    }
}

/// Failure while applying a desired-state delta.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Twin not found: {0}")]
    TwinNotFound(String),

    #[error("Not a delta topic: {0}")]
    Topic(String),

    #[error("Undecodable delta payload: {0}")]
    Payload(String),

    #[error("Conversion failed: {0}")]
    Conversion(#[from] CodecError),

    #[error("Device '{0}' has no open client")]
    NotStarted(String),

    #[error("Write failed: {0}")]
    Io(#[from] IoError),
}

/// Failure of one sampling cycle. The task keeps its schedule.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Read failed: {0}")]
    Io(#[from] IoError),

    #[error("Decode failed: {0}")]
    Decode(#[from] CodecError),

    #[error("Publish failed: {0}")]
    Publish(#[from] MapperError),
}

/// Failure to start a device.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Device '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Mapper is shutting down")]
    ShuttingDown,

    #[error("Device '{0}' was stopped while starting")]
    Cancelled(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Failed to subscribe: {0}")]
    Subscribe(#[from] MapperError),
}
