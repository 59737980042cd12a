//! Device lifecycle: start, run and stop every device in the registry.
//!
//! Starting a device opens its client (serialized through [`SingleFlight`]),
//! optionally pushes the desired values from the profile, then spawns one sampling task per twin and aggregate,
//! one status probe and one delta delivery loop. All of a device's tasks
//! share a cancellation token and live in the device's own `JoinSet`, so a
//! device is stopped without touching the others.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mapper_common::DeviceTopics;
use mapper_framework::{SharedBus, Subscription};

use crate::error::{ConnectionError, StartError};
use crate::notify::{DeviceNotice, Notifier};
use crate::probe::{PROBE_PERIOD, StatusProbe};
use crate::reconciler::{PairOutcome, Reconciler, write_value};
use crate::registry::{DeviceInstance, DeviceRuntime, Registry};
use crate::sampler::{RetryPolicy, SampleTarget, SamplingUnit};
use crate::transport::{RegisterClient, SingleFlight, TransportOptions, open_client};

/// Opens the register client for a device.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        device: &DeviceInstance,
    ) -> Result<Arc<dyn RegisterClient>, ConnectionError>;
}

/// Connects over Modbus RTU or TCP as the device's protocol says.
#[derive(Debug, Clone, Default)]
pub struct ModbusConnector {
    options: TransportOptions,
}

impl ModbusConnector {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for ModbusConnector {
    async fn open(
        &self,
        device: &DeviceInstance,
    ) -> Result<Arc<dyn RegisterClient>, ConnectionError> {
        open_client(&device.protocol, &self.options).await
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub transport: TransportOptions,
    pub retry: RetryPolicy,
    /// Write profile desired values to writable twins at start.
    pub push_desired_on_start: bool,
    /// Node name carried by notices.
    pub node_name: String,
    pub probe_period: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            transport: TransportOptions::default(),
            retry: RetryPolicy::default(),
            push_desired_on_start: true,
            node_name: "edge-node".to_string(),
            probe_period: PROBE_PERIOD,
        }
    }
}

struct DeviceHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

/// Runs every device of a registry until told to stop.
pub struct Orchestrator {
    registry: Arc<Registry>,
    bus: SharedBus,
    notifier: Arc<dyn Notifier>,
    connector: Arc<dyn Connector>,
    reconciler: Arc<Reconciler>,
    options: OrchestratorOptions,
    shutdown: CancellationToken,
    running: Mutex<BTreeMap<String, DeviceHandle>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        bus: SharedBus,
        notifier: Arc<dyn Notifier>,
        options: OrchestratorOptions,
    ) -> Self {
        let connector = Arc::new(ModbusConnector::new(options.transport));
        Self {
            reconciler: Arc::new(Reconciler::new(registry.clone())),
            registry,
            bus,
            notifier,
            connector,
            options,
            shutdown: CancellationToken::new(),
            running: Mutex::new(BTreeMap::new()),
        }
    }

    /// Replace how device clients are opened.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// IDs of the devices currently running or starting.
    pub async fn running_devices(&self) -> Vec<String> {
        self.running.lock().await.keys().cloned().collect()
    }

    /// Start every device. Devices that fail to start are reported and
    /// skipped. Returns the IDs of the started devices.
    pub async fn start_all(&self) -> Vec<String> {
        let mut started = Vec::new();

        for id in self.registry.ids() {
            match self.start_device(&id).await {
                Ok(()) => started.push(id),
                Err(e) => error!("Device '{}' not started: {}", id, e),
            }
        }

        info!(
            "Started {} of {} device(s)",
            started.len(),
            self.registry.len()
        );
        started
    }

    /// Start one device.
    ///
    /// The device is reserved in the running set first, so a concurrent
    /// start of the same device fails fast. Connecting happens without
    /// holding the running set.
    pub async fn start_device(&self, id: &str) -> Result<(), StartError> {
        let device = self
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| StartError::UnknownDevice(id.to_string()))?;

        if self.shutdown.is_cancelled() {
            return Err(StartError::ShuttingDown);
        }

        let cancel = self.shutdown.child_token();
        {
            let mut running = self.running.lock().await;
            if running.contains_key(id) {
                return Err(StartError::AlreadyRunning(id.to_string()));
            }
            running.insert(
                id.to_string(),
                DeviceHandle {
                    cancel: cancel.clone(),
                    tasks: JoinSet::new(),
                },
            );
        }

        let mut tasks = match self.launch(&device, &cancel).await {
            Ok(tasks) => tasks,
            Err(e) => {
                // A cancelled token means stop_device already dropped the entry,
                // unless the whole mapper is shutting down.
                if !cancel.is_cancelled() || self.shutdown.is_cancelled() {
                    self.running.lock().await.remove(id);
                }
                return Err(e);
            }
        };

        let mut running = self.running.lock().await;
        if !cancel.is_cancelled() {
            if let Some(handle) = running.get_mut(id) {
                handle.tasks = tasks;
                return Ok(());
            }
        }
        if self.shutdown.is_cancelled() {
            running.remove(id);
        }
        drop(running);

        tasks.shutdown().await;
        if let Some(client) = device.release_client() {
            client.close().await;
        }
        Err(StartError::Cancelled(id.to_string()))
    }

    /// Open the client and spawn every task of a device.
    async fn launch(
        &self,
        device: &DeviceRuntime,
        cancel: &CancellationToken,
    ) -> Result<JoinSet<()>, StartError> {
        let id = device.id();

        let client = match self.connector.open(device.instance()).await {
            Ok(client) => client,
            Err(e) => {
                let notice = DeviceNotice::unreachable(&self.options.node_name, id, &e.to_string());
                self.notifier.notify_unreachable(&notice).await;
                return Err(e.into());
            }
        };
        let client: Arc<dyn RegisterClient> = Arc::new(SingleFlight::new(client));
        device.attach_client(client.clone());

        if self.options.push_desired_on_start {
            push_desired(device, client.as_ref()).await;
        }

        let topics = DeviceTopics::new(id);
        let subscription = match self.bus.subscribe(&topics.twin_delta()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Some(client) = device.release_client() {
                    client.close().await;
                }
                return Err(e.into());
            }
        };

        let mut tasks = JoinSet::new();

        let instance = device.instance();
        for twin in &instance.twins {
            let unit = SamplingUnit::new(
                id,
                SampleTarget::Twin(twin.clone()),
                client.clone(),
                self.bus.clone(),
                self.options.retry,
            );
            tasks.spawn(unit.run(cancel.clone()));
        }
        for aggregate in &instance.aggregates {
            let unit = SamplingUnit::new(
                id,
                SampleTarget::Aggregate(aggregate.clone()),
                client.clone(),
                self.bus.clone(),
                self.options.retry,
            );
            tasks.spawn(unit.run(cancel.clone()));
        }

        let probe = StatusProbe::new(
            id,
            self.options.node_name.clone(),
            client.clone(),
            self.bus.clone(),
            self.notifier.clone(),
        )
        .with_period(self.options.probe_period);
        tasks.spawn(probe.run(cancel.clone()));

        tasks.spawn(deliver_deltas(
            id.to_string(),
            subscription,
            self.reconciler.clone(),
            cancel.clone(),
        ));

        info!(
            "Device '{}' started ({} twins, {} aggregates)",
            id,
            instance.twins.len(),
            instance.aggregates.len()
        );

        Ok(tasks)
    }

    /// Stop one device: cancel its tasks, wait for them and close its
    /// client. Returns false if the device was not running.
    pub async fn stop_device(&self, id: &str) -> bool {
        let handle = self.running.lock().await.remove(id);
        let Some(DeviceHandle { cancel, mut tasks }) = handle else {
            return false;
        };

        cancel.cancel();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Device '{}': task panicked: {}", id, e);
                }
            }
        }

        if let Some(device) = self.registry.get(id) {
            if let Some(client) = device.release_client() {
                client.close().await;
            }
        }

        info!("Device '{}' stopped", id);
        true
    }

    /// Stop every running device. No device can be started afterwards.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        for id in self.running_devices().await {
            self.stop_device(&id).await;
        }
    }

    /// Wait for `shutdown` to resolve, then stop every device.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        shutdown.await;
        info!("Stopping all devices");
        self.stop_all().await;
    }
}

/// Write the profile's desired values to writable twins.
async fn push_desired(device: &DeviceRuntime, client: &dyn RegisterClient) {
    for twin in &device.instance().twins {
        let desired = twin.desired();
        if twin.is_read_only() || desired.is_empty() {
            continue;
        }

        match write_value(twin, &desired, client).await {
            Ok(word) => debug!(
                "Device '{}': initial '{}' = '{}' written as {}",
                device.id(),
                twin.property_name,
                desired,
                word
            ),
            Err(e) => warn!(
                "Device '{}': initial '{}' = '{}' not written: {}",
                device.id(),
                twin.property_name,
                desired,
                e
            ),
        }
    }
}

/// Apply deltas for one device in arrival order until cancelled.
async fn deliver_deltas(
    device_id: String,
    mut subscription: Subscription,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) {
    debug!("Device '{}': listening on {}", device_id, subscription.topic());

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = subscription.recv() => message,
        };

        let Some(message) = message else {
            warn!("Device '{}': delta subscription closed", device_id);
            break;
        };

        match reconciler.handle_message(&message.topic, &message.payload).await {
            Ok(report) => {
                for pair in &report.pairs {
                    if let PairOutcome::Failed(e) = &pair.outcome {
                        debug!("Device '{}': '{}' failed: {}", device_id, pair.property, e);
                    }
                }
                debug!(
                    "Device '{}': delta applied ({} pairs, {} writes)",
                    device_id,
                    report.pairs.len(),
                    report.writes()
                );
            }
            Err(e) => warn!("Device '{}': delta rejected: {}", device_id, e),
        }
    }
}
