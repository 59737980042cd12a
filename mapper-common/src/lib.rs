//! Mapper Common Library
//!
//! Shared types and utilities for edge device mappers:
//!
//! - [`message`] - Twin, data and state messages exchanged with the cloud
//! - [`topics`] - Event bus topic builders and parsers
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`session`] - Zenoh session management
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod message;
pub mod session;
pub mod topics;

// Re-export commonly used types at the crate root
pub use config::{
    BaseConfig, BusBackend, BusConfig, LogFormat, LoggingConfig, MqttConfig, ZenohConfig,
    load_config, parse_config,
};
pub use error::{Error, Result};
pub use message::{
    BaseMessage, DeviceData, DeviceStateUpdate, DeviceTwinDelta, DeviceTwinUpdate, MsgTwin,
    current_timestamp_millis, decode, encode,
};
pub use session::connect;
pub use topics::{DeviceTopics, parse_delta_topic, status_key};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over `config.level` when set.
///
/// # Example
///
/// ```ignore
/// use mapper_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}
