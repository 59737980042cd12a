//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use mapper_common::BaseConfig;

use crate::error::{MapperError, Result};

/// Trait for mapper configuration types.
///
/// Implement this trait for a mapper's configuration struct to get
/// loading, validation, and access to the shared bus and logging settings.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use mapper_common::BaseConfig;
/// use mapper_framework::{MapperConfig, MapperError, Result};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyMapperConfig {
///     #[serde(flatten)]
///     pub base: BaseConfig,
///     pub my_protocol: MyProtocolConfig,
/// }
///
/// impl MapperConfig for MyMapperConfig {
///     fn base(&self) -> &BaseConfig {
///         &self.base
///     }
///
///     fn key_prefix(&self) -> &str {
///         &self.my_protocol.key_prefix
///     }
///
///     fn validate(&self) -> Result<()> {
///         if self.my_protocol.profile.is_empty() {
///             return Err(MapperError::validation("A device profile is required"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait MapperConfig: Sized + DeserializeOwned {
    /// Bus, Zenoh, MQTT and logging settings.
    fn base(&self) -> &BaseConfig;

    /// Get the key prefix for mapper-level keys (status).
    fn key_prefix(&self) -> &str;

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(MapperError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 string.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}
