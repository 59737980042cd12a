//! Unreachable-device notifications.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use mapper_common::DeviceTopics;
use mapper_framework::{SharedBus, publish_json};

/// A warning that a device cannot be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNotice {
    /// Edge node the mapper runs on.
    pub node: String,
    pub device: String,
    /// `<device>disconnect`
    pub reason: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notice_type: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl DeviceNotice {
    /// Build the notice raised when `device` becomes unreachable.
    pub fn unreachable(node: impl Into<String>, device: impl Into<String>, detail: &str) -> Self {
        let device = device.into();
        Self {
            node: node.into(),
            reason: format!("{}disconnect", device),
            message: format!("{} device unavailable: {}", device, detail),
            notice_type: "Warning".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            device,
        }
    }
}

/// Sink for device notices.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_unreachable(&self, notice: &DeviceNotice);
}

/// Logs notices at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_unreachable(&self, notice: &DeviceNotice) {
        warn!(
            node = %notice.node,
            device = %notice.device,
            reason = %notice.reason,
            "{}",
            notice.message
        );
    }
}

/// Logs notices and publishes them to `hw/events/device/{id}/notice`.
pub struct BusNotifier {
    bus: SharedBus,
}

impl BusNotifier {
    pub fn new(bus: SharedBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Notifier for BusNotifier {
    async fn notify_unreachable(&self, notice: &DeviceNotice) {
        LogNotifier.notify_unreachable(notice).await;

        let topic = DeviceTopics::new(notice.device.clone()).notice();
        if let Err(e) = publish_json(self.bus.as_ref(), &topic, notice).await {
            warn!("Failed to publish notice for '{}': {}", notice.device, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapper_framework::MemoryBus;
    use std::sync::Arc;

    #[test]
    fn test_unreachable_notice() {
        let notice = DeviceNotice::unreachable("edge-1", "pump1", "connection refused");
        assert_eq!(notice.reason, "pump1disconnect");
        assert_eq!(notice.notice_type, "Warning");
        assert!(notice.message.starts_with("pump1 device unavailable"));

        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "Warning");
        assert_eq!(json["node"], "edge-1");
    }

    #[test]
    fn test_bus_notifier_publishes() {
        tokio_test::block_on(async {
            let bus = MemoryBus::new();
            let notifier = BusNotifier::new(Arc::new(bus.clone()));
            let notice = DeviceNotice::unreachable("edge-1", "pump1", "timeout");

            notifier.notify_unreachable(&notice).await;

            let published = bus.published_on("hw/events/device/pump1/notice");
            assert_eq!(published.len(), 1);
            let decoded: DeviceNotice = serde_json::from_slice(&published[0].payload).unwrap();
            assert_eq!(decoded, notice);
        });
    }
}
