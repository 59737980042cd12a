//! Mapper status reporting.

use serde::{Deserialize, Serialize};

use mapper_common::status_key;

use crate::Result;
use crate::bus::{SharedBus, publish_json};

/// Mapper status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperStatus {
    /// Mapper name (e.g., "modbus").
    pub mapper: String,
    /// Mapper version.
    pub version: String,
    /// Current status ("running", "offline", "error").
    pub status: String,
    /// Additional metadata (protocol-specific).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl MapperStatus {
    fn with_state(mapper: impl Into<String>, version: impl Into<String>, status: &str) -> Self {
        Self {
            mapper: mapper.into(),
            version: version.into(),
            status: status.to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a new status with "running" state.
    pub fn running(mapper: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(mapper, version, "running")
    }

    /// Create a status with "offline" state.
    pub fn offline(mapper: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(mapper, version, "offline")
    }

    /// Create a status with "error" state.
    pub fn error(
        mapper: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_state(mapper, version, "error")
            .with_metadata(serde_json::json!({ "error": error.into() }))
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Publishes mapper status to `{key_prefix}/@/status`.
pub struct StatusPublisher {
    bus: SharedBus,
    key: String,
    mapper_name: String,
    version: String,
}

impl StatusPublisher {
    /// Create a new status publisher.
    pub fn new(
        bus: SharedBus,
        key_prefix: &str,
        mapper_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            key: status_key(key_prefix),
            mapper_name: mapper_name.into(),
            version: version.into(),
        }
    }

    /// The key statuses are published on.
    pub fn key(&self) -> &str {
        &self.key
    }

    async fn publish(&self, status: &MapperStatus) -> Result<()> {
        publish_json(self.bus.as_ref(), &self.key, status).await
    }

    /// Publish "running" status with optional metadata.
    pub async fn publish_running(&self, metadata: Option<serde_json::Value>) -> Result<()> {
        let mut status = MapperStatus::running(&self.mapper_name, &self.version);
        if let Some(meta) = metadata {
            status = status.with_metadata(meta);
        }
        self.publish(&status).await
    }

    /// Publish "offline" status.
    pub async fn publish_offline(&self) -> Result<()> {
        self.publish(&MapperStatus::offline(&self.mapper_name, &self.version))
            .await
    }

    /// Publish "error" status.
    pub async fn publish_error(&self, error: impl Into<String>) -> Result<()> {
        self.publish(&MapperStatus::error(&self.mapper_name, &self.version, error))
            .await
    }
}
