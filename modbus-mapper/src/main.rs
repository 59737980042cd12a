//! Modbus device mapper.
//!
//! Loads a device profile, connects to every Modbus device it lists and
//! keeps their twins in sync with the message bus until stopped.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use mapper_framework::{MapperArgs, MapperConfig, MapperRunner};
use modbus_mapper::{
    BusNotifier, LogNotifier, ModbusMapperConfig, NoticeSink, Notifier, Orchestrator, Registry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = MapperArgs::parse_with_default("modbus-mapper.json5");

    let config = ModbusMapperConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let runner = MapperRunner::new_with_args("modbus", config, Some(&args))
        .await?
        .with_status_publishing();

    let settings = runner.config().mapper.clone();
    info!("Loading device profile from {:?}", settings.profile);

    let registry = Registry::load(&settings.profile)
        .with_context(|| format!("Failed to load device profile {:?}", settings.profile))?;
    info!("Loaded {} device(s)", registry.len());

    let bus = runner.bus();
    let notifier: Arc<dyn Notifier> = match settings.notices {
        NoticeSink::Bus => Arc::new(BusNotifier::new(bus.clone())),
        NoticeSink::Log => Arc::new(LogNotifier),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(registry),
        bus,
        notifier,
        settings.orchestrator_options(),
    ));

    let started = orchestrator.start_all().await;
    let metadata = serde_json::json!({ "devices": started });

    runner
        .run_with_shutdown(Some(metadata), || async move {
            orchestrator.stop_all().await;
        })
        .await?;

    Ok(())
}
