//! Periodic device reachability reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mapper_common::{DeviceStateUpdate, DeviceTopics};
use mapper_framework::{SharedBus, publish_json};

use crate::notify::{DeviceNotice, Notifier};
use crate::transport::{LinkState, RegisterClient};

/// Default probe interval.
pub const PROBE_PERIOD: Duration = Duration::from_secs(1);

/// Probes one device and publishes its state.
pub struct StatusProbe {
    device_id: String,
    node_name: String,
    topics: DeviceTopics,
    client: Arc<dyn RegisterClient>,
    bus: SharedBus,
    notifier: Arc<dyn Notifier>,
    period: Duration,
    last: Option<LinkState>,
}

impl StatusProbe {
    pub fn new(
        device_id: impl Into<String>,
        node_name: impl Into<String>,
        client: Arc<dyn RegisterClient>,
        bus: SharedBus,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            topics: DeviceTopics::new(device_id.clone()),
            device_id,
            node_name: node_name.into(),
            client,
            bus,
            notifier,
            period: PROBE_PERIOD,
            last: None,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Probe once, publish the state and raise a notice when the device
    /// goes offline.
    pub async fn probe_once(&mut self) -> LinkState {
        let state = self.client.probe().await;

        let update = DeviceStateUpdate::new(state.as_str());
        if let Err(e) = publish_json(self.bus.as_ref(), &self.topics.state_update(), &update).await
        {
            warn!("Device '{}': failed to publish state: {}", self.device_id, e);
        }

        if self.last != Some(state) {
            match state {
                LinkState::Online => info!("Device '{}' is online", self.device_id),
                LinkState::Offline => {
                    let notice = DeviceNotice::unreachable(
                        &self.node_name,
                        &self.device_id,
                        "status probe failed",
                    );
                    self.notifier.notify_unreachable(&notice).await;
                }
            }
            self.last = Some(state);
        }

        state
    }

    /// Probe every period until cancelled, abandoning a probe in progress.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.probe_once() => {}
            }
        }

        debug!("Device '{}': status probe stopped", self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryClient;
    use async_trait::async_trait;
    use mapper_framework::MemoryBus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<DeviceNotice>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_unreachable(&self, notice: &DeviceNotice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }

    fn states(bus: &MemoryBus) -> Vec<String> {
        bus.published_on("hw/events/device/pump1/state/update")
            .iter()
            .map(|m| {
                let update: DeviceStateUpdate = serde_json::from_slice(&m.payload).unwrap();
                update.state
            })
            .collect()
    }

    #[tokio::test]
    async fn test_notifies_on_transition_to_offline() {
        let client = Arc::new(MemoryClient::new());
        let bus = MemoryBus::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut probe = StatusProbe::new(
            "pump1",
            "edge-1",
            client.clone(),
            Arc::new(bus.clone()),
            notifier.clone(),
        );

        assert_eq!(probe.probe_once().await, LinkState::Online);
        client.set_online(false);
        assert_eq!(probe.probe_once().await, LinkState::Offline);
        assert_eq!(probe.probe_once().await, LinkState::Offline);
        client.set_online(true);
        assert_eq!(probe.probe_once().await, LinkState::Online);

        assert_eq!(states(&bus), ["online", "offline", "offline", "online"]);

        let notices = notifier.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].reason, "pump1disconnect");
        assert_eq!(notices[0].node, "edge-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_second() {
        let client = Arc::new(MemoryClient::new());
        let bus = MemoryBus::new();
        let probe = StatusProbe::new(
            "pump1",
            "edge-1",
            client,
            Arc::new(bus.clone()),
            Arc::new(RecordingNotifier::default()),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(probe.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(states(&bus).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_status_check_in_progress() {
        let client = Arc::new(MemoryClient::new().with_latency(Duration::from_secs(10)));
        let bus = MemoryBus::new();
        let probe = StatusProbe::new(
            "pump1",
            "edge-1",
            client,
            Arc::new(bus.clone()),
            Arc::new(RecordingNotifier::default()),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(probe.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let stopping = Instant::now();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(stopping.elapsed(), Duration::ZERO);
        assert!(states(&bus).is_empty());
    }
}
