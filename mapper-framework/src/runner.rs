//! Mapper runner for lifecycle management.

use std::future::Future;

use mapper_common::{LoggingConfig, init_tracing};

use crate::MapperArgs;
use crate::bus::{SharedBus, connect_bus};
use crate::config::MapperConfig;
use crate::error::{MapperError, Result};
use crate::status::StatusPublisher;

/// Mapper runner that manages the lifecycle of a device mapper.
///
/// Handles:
/// - Logging initialization
/// - Message bus connection
/// - Status publishing (optional)
/// - Graceful shutdown on Ctrl+C / SIGTERM
///
/// # Example
///
/// ```ignore
/// use mapper_framework::{MapperArgs, MapperConfig, MapperRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = MapperArgs::parse_with_default("mymapper.json5");
///     let config = MyMapperConfig::load(&args.config)?;
///
///     let runner = MapperRunner::new_with_args("mymapper", config, Some(&args))
///         .await?
///         .with_status_publishing();
///
///     let bus = runner.bus();
///     // start device workers on `bus` ...
///
///     runner.run_with_shutdown(None, || async { /* stop workers */ }).await?;
///     Ok(())
/// }
/// ```
pub struct MapperRunner<C: MapperConfig> {
    /// Mapper name for logging and status.
    name: String,
    /// Mapper version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Connected message bus.
    bus: SharedBus,
    /// Status publisher (optional).
    status_publisher: Option<StatusPublisher>,
}

impl<C: MapperConfig> MapperRunner<C> {
    /// Create a new mapper runner with CLI args for log level override.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Connect to the configured message bus
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&MapperArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = match args.and_then(|a| a.log_level.clone()) {
            Some(level) => LoggingConfig {
                level,
                ..config.base().logging.clone()
            },
            None => config.base().logging.clone(),
        };
        init_tracing(&log_config).map_err(|e| MapperError::config(e.to_string()))?;

        tracing::info!(mapper = %name, version = %version, "Starting mapper");

        let bus = connect_bus(config.base()).await?;

        tracing::info!(backend = ?config.base().bus.backend, "Message bus ready");

        Ok(Self {
            name,
            version,
            config,
            bus,
            status_publisher: None,
        })
    }

    /// Enable status publishing.
    ///
    /// When enabled, the runner publishes status messages on startup and shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(StatusPublisher::new(
            self.bus.clone(),
            self.config.key_prefix(),
            &self.name,
            &self.version,
        ));
        self
    }

    /// Get the mapper name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a handle to the message bus.
    pub fn bus(&self) -> SharedBus {
        self.bus.clone()
    }

    /// Get the status publisher, if enabled.
    pub fn status_publisher(&self) -> Option<&StatusPublisher> {
        self.status_publisher.as_ref()
    }

    /// Run until a shutdown signal is received.
    ///
    /// This will:
    /// 1. Publish "running" status (if enabled)
    /// 2. Wait for Ctrl+C or SIGTERM
    /// 3. Run the `shutdown` hook (stop workers, release devices)
    /// 4. Publish "offline" status (if enabled)
    /// 5. Close the message bus
    pub async fn run_with_shutdown<F, Fut>(
        self,
        metadata: Option<serde_json::Value>,
        shutdown: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_running(metadata).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(mapper = %self.name, "Mapper running. Press Ctrl+C to stop.");

        shutdown_signal().await;

        tracing::info!(mapper = %self.name, "Received shutdown signal");

        shutdown().await;

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline().await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        if let Err(e) = self.bus.close().await {
            tracing::warn!(error = %e, "Error closing message bus");
        }

        tracing::info!(mapper = %self.name, "Goodbye!");

        Ok(())
    }
}

/// Resolve when the process is asked to stop (Ctrl+C, or SIGTERM on unix).
pub async fn shutdown_signal() {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        },
        _ = terminate() => {},
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

