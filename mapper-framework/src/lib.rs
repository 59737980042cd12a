//! Mapper Framework
//!
//! Common abstractions for building device mappers that exchange twin state
//! over a publish/subscribe bus.
//!
//! # Overview
//!
//! This framework provides:
//! - [`MapperConfig`] trait for configuration loading and validation
//! - [`MapperRunner`] for managing mapper lifecycle (startup, shutdown, signal handling)
//! - [`MessageBus`] with Zenoh, MQTT and in-memory backends
//! - [`MapperArgs`] for common CLI argument parsing
//! - [`MapperStatus`] for standardized status reporting

mod args;
pub mod bus;
mod config;
mod error;
mod runner;
mod status;

pub use args::MapperArgs;
pub use bus::{
    InboundMessage, MemoryBus, MessageBus, MqttBus, SharedBus, Subscription, ZenohBus,
    publish_json,
};
pub use config::MapperConfig;
pub use error::{MapperError, Result};
pub use runner::{MapperRunner, shutdown_signal};
pub use status::{MapperStatus, StatusPublisher};

// Re-export commonly used types from mapper-common
pub use mapper_common::{BaseConfig, BusBackend, LoggingConfig, MqttConfig, ZenohConfig};
