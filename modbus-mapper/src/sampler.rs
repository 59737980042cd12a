//! Recurring register sampling.
//!
//! Each twin and each aggregate sensor gets its own [`SamplingUnit`] running
//! on its own timer. A cycle reads the registers, decodes them and publishes
//! the value; a failed cycle is logged and the schedule continues.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mapper_common::{DeviceData, DeviceTopics, DeviceTwinUpdate};
use mapper_framework::{SharedBus, publish_json};

use crate::codec::{self, DataType, RegisterLayout};
use crate::error::{IoError, SampleError};
use crate::registry::{Aggregate, Twin};
use crate::transport::{RegisterBank, RegisterClient};

/// Extra read attempts within one sampling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    /// Base delay; attempt `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff: Duration::from_millis(100),
        }
    }
}

/// What a sampling unit reads and where it reports.
#[derive(Debug, Clone)]
pub enum SampleTarget {
    /// A twin property: updates `reported` and publishes a twin update.
    Twin(Arc<Twin>),
    /// An aggregate sensor: publishes a data update.
    Aggregate(Aggregate),
}

impl SampleTarget {
    pub fn name(&self) -> &str {
        match self {
            SampleTarget::Twin(twin) => &twin.property_name,
            SampleTarget::Aggregate(aggregate) => &aggregate.name,
        }
    }

    fn period(&self) -> Duration {
        match self {
            SampleTarget::Twin(twin) => twin.visitor.period,
            SampleTarget::Aggregate(aggregate) => aggregate.period,
        }
    }

    fn registers(&self) -> (RegisterBank, u16, u16) {
        match self {
            SampleTarget::Twin(twin) => (twin.visitor.bank, twin.visitor.offset, twin.visitor.limit),
            SampleTarget::Aggregate(a) => (a.bank, a.offset, a.limit),
        }
    }

    fn decoding(&self) -> (DataType, RegisterLayout) {
        match self {
            SampleTarget::Twin(twin) => (twin.data_type, twin.visitor.layout),
            SampleTarget::Aggregate(a) => (a.data_type, RegisterLayout::default()),
        }
    }
}

/// One independently scheduled sampling task.
pub struct SamplingUnit {
    device_id: String,
    topics: DeviceTopics,
    target: SampleTarget,
    client: Arc<dyn RegisterClient>,
    bus: SharedBus,
    retry: RetryPolicy,
}

impl SamplingUnit {
    pub fn new(
        device_id: impl Into<String>,
        target: SampleTarget,
        client: Arc<dyn RegisterClient>,
        bus: SharedBus,
        retry: RetryPolicy,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            topics: DeviceTopics::new(device_id.clone()),
            device_id,
            target,
            client,
            bus,
            retry,
        }
    }

    /// Interval between cycles.
    pub fn period(&self) -> Duration {
        self.target.period()
    }

    pub fn target(&self) -> &SampleTarget {
        &self.target
    }

    /// Run one cycle: read, decode, record and publish. Returns the value.
    pub async fn sample_once(&self) -> Result<String, SampleError> {
        let words = self.read_with_retry().await?;
        let (data_type, layout) = self.target.decoding();
        let value = codec::decode(&words, data_type, &layout)?;

        match &self.target {
            SampleTarget::Twin(twin) => {
                twin.set_reported(value.clone());
                let update = DeviceTwinUpdate::actual(
                    twin.property_name.clone(),
                    twin.value_type.clone(),
                    value.clone(),
                );
                publish_json(self.bus.as_ref(), &self.topics.twin_update(), &update).await?;
            }
            SampleTarget::Aggregate(aggregate) => {
                let data =
                    DeviceData::single(aggregate.name.clone(), data_type.as_str(), value.clone());
                publish_json(self.bus.as_ref(), &self.topics.data_update(), &data).await?;
            }
        }

        Ok(value)
    }

    async fn read_with_retry(&self) -> Result<Vec<u16>, IoError> {
        let (bank, offset, quantity) = self.target.registers();
        let mut attempt = 0;

        loop {
            match self.client.read(bank, offset, quantity).await {
                Ok(words) => return Ok(words),
                Err(e) if attempt < self.retry.retries => {
                    attempt += 1;
                    debug!(
                        "Device '{}': read of '{}' failed (attempt {}): {}",
                        self.device_id,
                        self.target.name(),
                        attempt,
                        e
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sample every period until cancelled. The first cycle runs one period
    /// after start; cancelling also abandons a cycle in progress.
    pub async fn run(self, cancel: CancellationToken) {
        let period = self.period();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            "Device '{}': sampling '{}' every {:?}",
            self.device_id,
            self.target.name(),
            period
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A cycle in progress is abandoned on cancel.
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.sample_once() => result,
            };
            if let Err(e) = result {
                warn!(
                    "Device '{}': sampling '{}' failed: {}",
                    self.device_id,
                    self.target.name(),
                    e
                );
            }
        }

        debug!("Device '{}': sampler '{}' stopped", self.device_id, self.target.name());
    }
}
