//! Register access over Modbus RTU or TCP.
//!
//! The rest of the mapper talks to devices through the [`RegisterClient`]
//! trait. [`ModbusClient`] implements it on top of `tokio-modbus`;
//! [`MemoryClient`] keeps registers in memory for tests and dry runs.
//! [`SingleFlight`] serializes the requests of everything sharing a client.

mod memory;
mod modbus;
mod single_flight;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ConnectionError, IoError};
use crate::profile::ProtocolSpec;

pub use self::memory::{MemoryClient, WriteRecord};
pub use self::modbus::ModbusClient;
pub use self::single_flight::SingleFlight;

/// Default connection and request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Modbus register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterBank {
    /// Discrete output coils (read/write, 1-bit)
    #[serde(rename = "CoilRegister")]
    Coil,
    /// Discrete input contacts (read-only, 1-bit)
    #[serde(rename = "DiscreteInputRegister")]
    DiscreteInput,
    /// Holding registers (read/write, 16-bit)
    #[serde(rename = "HoldingRegister")]
    Holding,
    /// Input registers (read-only, 16-bit)
    #[serde(rename = "InputRegister")]
    Input,
}

impl RegisterBank {
    /// Return the profile name for this bank.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterBank::Coil => "CoilRegister",
            RegisterBank::DiscreteInput => "DiscreteInputRegister",
            RegisterBank::Holding => "HoldingRegister",
            RegisterBank::Input => "InputRegister",
        }
    }
}

impl fmt::Display for RegisterBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown register bank '{0}'")]
pub struct UnknownBank(pub String);

impl FromStr for RegisterBank {
    type Err = UnknownBank;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CoilRegister" | "coil" => Ok(RegisterBank::Coil),
            "DiscreteInputRegister" | "discrete" => Ok(RegisterBank::DiscreteInput),
            "HoldingRegister" | "holding" => Ok(RegisterBank::Holding),
            "InputRegister" | "input" => Ok(RegisterBank::Input),
            _ => Err(UnknownBank(s.to_string())),
        }
    }
}

/// Reachability of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Online,
    Offline,
}

impl LinkState {
    /// Return the state name published on the state topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Online => "online",
            LinkState::Offline => "offline",
        }
    }
}

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// "none", "even" or "odd"
    pub parity: String,
    /// Line is RS485 (`customizedValues.serialType == "RS485"`).
    pub rs485: bool,
}

/// Resolved transport for a protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    /// Modbus RTU over a serial line
    Rtu(SerialSettings),
    /// Modbus TCP
    Tcp { host: String, port: u16 },
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Rtu(serial) => write!(f, "rtu:{}@{}", serial.port, serial.baud_rate),
            Link::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

/// Protocol settings of one device, as declared in the profile.
///
/// Transport selection is deferred to [`ProtocolConfig::link`] so that a
/// protocol with neither a serial port nor an IP only fails for the devices
/// that use it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub name: String,
    /// Modbus unit/slave ID
    pub slave_id: u8,
    pub serial: SerialSettings,
    pub tcp_host: String,
    pub tcp_port: u16,
}

impl ProtocolConfig {
    pub fn from_spec(spec: &ProtocolSpec) -> Self {
        let common = &spec.protocol_common_config;
        let rs485 = common
            .customized_values
            .get("serialType")
            .and_then(|v| v.as_str())
            == Some("RS485");

        Self {
            name: spec.name.clone(),
            slave_id: spec.protocol_config.slave_id,
            serial: SerialSettings {
                port: common.com.serial_port.clone(),
                baud_rate: common.com.baud_rate,
                data_bits: common.com.data_bits,
                stop_bits: common.com.stop_bits,
                parity: common.com.parity.clone(),
                rs485,
            },
            tcp_host: common.tcp.ip.clone(),
            tcp_port: common.tcp.port,
        }
    }

    /// Pick the transport: a serial port selects RTU, otherwise an IP
    /// selects TCP.
    pub fn link(&self) -> Result<Link, ConnectionError> {
        if !self.serial.port.is_empty() {
            Ok(Link::Rtu(self.serial.clone()))
        } else if !self.tcp_host.is_empty() {
            Ok(Link::Tcp {
                host: self.tcp_host.clone(),
                port: self.tcp_port,
            })
        } else {
            Err(ConnectionError::NoTransport)
        }
    }
}

/// Transport tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// Connection and per-request timeout.
    pub timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Register-level access to one device.
///
/// Implementations need not serialize requests; callers sharing a client
/// wrap it in [`SingleFlight`]. No request is retried internally.
#[async_trait]
pub trait RegisterClient: Send + Sync {
    /// Read `quantity` registers starting at `offset`. Coils and discrete
    /// inputs are returned as 0/1 words.
    async fn read(&self, bank: RegisterBank, offset: u16, quantity: u16)
    -> Result<Vec<u16>, IoError>;

    /// Write one register (holding) or one coil (non-zero is on).
    async fn write(&self, bank: RegisterBank, offset: u16, value: u16) -> Result<(), IoError>;

    /// Check reachability, reconnecting a dropped link.
    async fn probe(&self) -> LinkState;

    /// Release the underlying handle. Later requests fail.
    async fn close(&self);
}

/// Open a Modbus client for a protocol.
pub async fn open_client(
    protocol: &ProtocolConfig,
    options: &TransportOptions,
) -> Result<Arc<dyn RegisterClient>, ConnectionError> {
    let link = protocol.link()?;
    let client = ModbusClient::connect(link, protocol.slave_id, options).await?;
    Ok(Arc::new(client))
}
