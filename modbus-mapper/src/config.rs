//! Configuration for the Modbus mapper.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mapper_common::BaseConfig;
use mapper_framework::{MapperConfig, MapperError, Result};

use crate::orchestrator::OrchestratorOptions;
use crate::probe::PROBE_PERIOD;
use crate::sampler::RetryPolicy;
use crate::transport::TransportOptions;

/// Complete mapper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusMapperConfig {
    /// Bus, Zenoh, MQTT and logging settings
    #[serde(flatten)]
    pub base: BaseConfig,

    /// Mapper-specific settings
    #[serde(default)]
    pub mapper: MapperSettings,
}

/// Where unreachable-device notices go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeSink {
    /// Log and publish on the device notice topic (default).
    #[default]
    Bus,
    /// Log only.
    Log,
}

/// Modbus mapper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperSettings {
    /// Key prefix for mapper status (default: "mapper/modbus")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Device profile path
    #[serde(default = "default_profile")]
    pub profile: PathBuf,

    /// Edge node name carried by notices
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Connection and request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Extra read attempts per sampling cycle
    #[serde(default)]
    pub read_retries: u32,

    /// Linear backoff between read attempts in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Write profile desired values to writable twins at start
    #[serde(default = "default_push_desired")]
    pub push_desired_on_start: bool,

    #[serde(default)]
    pub notices: NoticeSink,
}

impl Default for MapperSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            profile: default_profile(),
            node_name: default_node_name(),
            timeout_ms: default_timeout_ms(),
            read_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            push_desired_on_start: default_push_desired(),
            notices: NoticeSink::default(),
        }
    }
}

fn default_key_prefix() -> String {
    "mapper/modbus".to_string()
}

fn default_profile() -> PathBuf {
    PathBuf::from("deviceProfile.json")
}

fn default_node_name() -> String {
    "edge-node".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_push_desired() -> bool {
    true
}

impl MapperSettings {
    /// Orchestrator options derived from these settings.
    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            transport: TransportOptions {
                timeout: Duration::from_millis(self.timeout_ms),
            },
            retry: RetryPolicy {
                retries: self.read_retries,
                backoff: Duration::from_millis(self.retry_backoff_ms),
            },
            push_desired_on_start: self.push_desired_on_start,
            node_name: self.node_name.clone(),
            probe_period: PROBE_PERIOD,
        }
    }
}

impl MapperConfig for ModbusMapperConfig {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn key_prefix(&self) -> &str {
        &self.mapper.key_prefix
    }

    fn validate(&self) -> Result<()> {
        let mapper = &self.mapper;

        if mapper.key_prefix.is_empty() {
            return Err(MapperError::validation("mapper.key_prefix cannot be empty"));
        }
        if mapper
            .key_prefix
            .chars()
            .any(|c| matches!(c, '*' | '$' | '#' | '+' | '?'))
        {
            return Err(MapperError::validation(format!(
                "mapper.key_prefix '{}' cannot contain wildcards",
                mapper.key_prefix
            )));
        }
        if mapper.profile.as_os_str().is_empty() {
            return Err(MapperError::validation("mapper.profile cannot be empty"));
        }
        if mapper.timeout_ms == 0 {
            return Err(MapperError::validation("mapper.timeout_ms must be positive"));
        }

        Ok(())
    }
}
