//! Device profile file format.
//!
//! The profile lists device instances, the models they implement and the
//! protocols they speak, using the camelCase field names of edge device
//! profiles. JSON and JSON5 are both accepted.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Complete device profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    #[serde(default)]
    pub device_instances: Vec<InstanceSpec>,

    #[serde(default)]
    pub device_models: Vec<ModelSpec>,

    #[serde(default)]
    pub protocols: Vec<ProtocolSpec>,
}

impl DeviceProfile {
    /// Load a profile from a JSON or JSON5 file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a profile from a string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(json5::from_str(content)?)
    }
}

/// One device instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub model: String,

    pub protocol: String,

    #[serde(default)]
    pub twins: Vec<TwinSpec>,

    #[serde(default)]
    pub property_visitors: Vec<PropertyVisitorSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinSpec {
    pub property_name: String,

    #[serde(default)]
    pub desired: TwinValueSpec,

    #[serde(default)]
    pub reported: TwinValueSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwinValueSpec {
    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub metadata: TwinMetadataSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwinMetadataSpec {
    #[serde(rename = "type", default)]
    pub value_type: String,
}

/// How a property maps onto registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyVisitorSpec {
    pub property_name: String,

    /// Sample interval in nanoseconds. Zero means the default of one second.
    #[serde(default)]
    pub collect_cycle: u64,

    pub visitor_config: VisitorConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorConfigSpec {
    /// Register bank, e.g. "HoldingRegister".
    pub register: String,

    pub offset: u16,

    /// Number of registers to read.
    #[serde(default = "default_limit")]
    pub limit: u16,

    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Swap bytes within each register.
    #[serde(default)]
    pub is_swap: bool,

    /// Reverse the order of registers.
    #[serde(default)]
    pub is_register_swap: bool,
}

fn default_limit() -> u16 {
    1
}

fn default_scale() -> f64 {
    1.0
}

/// A device model: the properties a device exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub name: String,

    #[serde(default)]
    pub properties: Vec<PropertySpec>,

    /// Extra aggregate sensors sampled for every device of this model.
    #[serde(default)]
    pub aggregates: Vec<AggregateSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySpec {
    pub name: String,

    pub data_type: String,

    #[serde(default = "default_access_mode")]
    pub access_mode: String,
}

fn default_access_mode() -> String {
    "ReadWrite".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSpec {
    pub name: String,

    pub register: String,

    pub offset: u16,

    #[serde(default = "default_limit")]
    pub limit: u16,

    #[serde(default = "default_aggregate_type")]
    pub data_type: String,

    /// Sample interval in nanoseconds. Zero means one second.
    #[serde(default)]
    pub collect_cycle: u64,
}

fn default_aggregate_type() -> String {
    "float".to_string()
}

/// A protocol definition referenced by device instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSpec {
    pub name: String,

    #[serde(default)]
    pub protocol: String,

    #[serde(default)]
    pub protocol_config: ProtocolConfigSpec,

    #[serde(default)]
    pub protocol_common_config: CommonConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfigSpec {
    #[serde(rename = "slaveID", default = "default_slave_id")]
    pub slave_id: u8,
}

impl Default for ProtocolConfigSpec {
    fn default() -> Self {
        Self {
            slave_id: default_slave_id(),
        }
    }
}

fn default_slave_id() -> u8 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfigSpec {
    #[serde(default)]
    pub com: ComSpec,

    #[serde(default)]
    pub tcp: TcpSpec,

    #[serde(default)]
    pub customized_values: HashMap<String, serde_json::Value>,
}

/// Serial line settings. An empty `serial_port` means "not serial".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComSpec {
    #[serde(default)]
    pub serial_port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// "none", "even" or "odd" (a single letter is accepted too).
    #[serde(default = "default_parity")]
    pub parity: String,
}

impl Default for ComSpec {
    fn default() -> Self {
        Self {
            serial_port: String::new(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_parity(),
        }
    }
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_parity() -> String {
    "none".to_string()
}

/// TCP settings. An empty `ip` means "not TCP".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpSpec {
    #[serde(default)]
    pub ip: String,

    #[serde(default = "default_modbus_port")]
    pub port: u16,
}

impl Default for TcpSpec {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: default_modbus_port(),
        }
    }
}

fn default_modbus_port() -> u16 {
    502
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"{
        "deviceInstances": [{
            "id": "pump1",
            "name": "pump-1",
            "model": "pump-model",
            "protocol": "modbus-tcp-1",
            "twins": [{
                "propertyName": "speed",
                "desired": { "value": "10", "metadata": { "type": "int" } }
            }],
            "propertyVisitors": [{
                "propertyName": "speed",
                "collectCycle": 500000000,
                "visitorConfig": { "register": "HoldingRegister", "offset": 10, "limit": 1 }
            }]
        }],
        "deviceModels": [{
            "name": "pump-model",
            "properties": [{ "name": "speed", "dataType": "int", "accessMode": "ReadWrite" }]
        }],
        "protocols": [{
            "name": "modbus-tcp-1",
            "protocol": "modbus",
            "protocolConfig": { "slaveID": 3 },
            "protocolCommonConfig": { "tcp": { "ip": "192.168.1.20" } }
        }]
    }"#;

    #[test]
    fn test_parse_profile() {
        let profile = DeviceProfile::parse(PROFILE).unwrap();

        let instance = &profile.device_instances[0];
        assert_eq!(instance.id, "pump1");
        assert_eq!(instance.twins[0].desired.value, "10");
        assert_eq!(instance.twins[0].desired.metadata.value_type, "int");

        let visitor = &instance.property_visitors[0];
        assert_eq!(visitor.collect_cycle, 500_000_000);
        assert_eq!(visitor.visitor_config.offset, 10);
        assert_eq!(visitor.visitor_config.scale, 1.0); // default
        assert!(!visitor.visitor_config.is_swap);

        let protocol = &profile.protocols[0];
        assert_eq!(protocol.protocol_config.slave_id, 3);
        assert_eq!(protocol.protocol_common_config.tcp.ip, "192.168.1.20");
        assert_eq!(protocol.protocol_common_config.tcp.port, 502); // default
        assert!(protocol.protocol_common_config.com.serial_port.is_empty());
    }

    #[test]
    fn test_parse_serial_protocol() {
        let json = r#"{
            protocols: [{
                name: "rtu-1",
                protocolCommonConfig: {
                    com: { serialPort: "/dev/ttyS0", baudRate: 19200, parity: "even" },
                    customizedValues: { serialType: "RS485" },
                },
            }],
        }"#;

        let profile = DeviceProfile::parse(json).unwrap();
        let common = &profile.protocols[0].protocol_common_config;
        assert_eq!(common.com.serial_port, "/dev/ttyS0");
        assert_eq!(common.com.baud_rate, 19200);
        assert_eq!(common.com.data_bits, 8);
        assert_eq!(common.customized_values["serialType"], "RS485");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            DeviceProfile::parse("{ deviceInstances: 3 }"),
            Err(ConfigError::Parse(_))
        ));
    }
}
