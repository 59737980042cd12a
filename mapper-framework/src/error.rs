//! Error types for the mapper framework.

use thiserror::Error;

/// Result type alias using [`MapperError`].
pub type Result<T> = std::result::Result<T, MapperError>;

/// Errors that can occur in a mapper.
#[derive(Error, Debug)]
pub enum MapperError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// Message bus connection error.
    #[error("Bus connection error: {0}")]
    BusConnection(String),

    /// Subscription error.
    #[error("Failed to subscribe to {topic}: {message}")]
    Subscribe { topic: String, message: String },

    /// Publishing error.
    #[error("Failed to publish to {key}: {message}")]
    Publish { key: String, message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MapperError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a publish error for a key.
    pub fn publish(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Publish {
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Create a subscribe error for a topic.
    pub fn subscribe(topic: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            message: err.to_string(),
        }
    }
}

impl From<mapper_common::Error> for MapperError {
    fn from(err: mapper_common::Error) -> Self {
        match err {
            mapper_common::Error::Config(msg) => Self::Config(msg),
            mapper_common::Error::Json(e) => Self::Serialization(e.to_string()),
            mapper_common::Error::Io(e) => Self::Io(e),
            other => Self::BusConnection(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for MapperError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json5::Error> for MapperError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}
