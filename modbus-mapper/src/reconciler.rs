//! Applies desired-state deltas to devices.

use std::sync::Arc;

use tracing::{debug, info, warn};

use mapper_common::{DeviceTwinDelta, decode, parse_delta_topic};

use crate::codec;
use crate::error::ReconcileError;
use crate::registry::{DeviceRuntime, Registry, Twin};
use crate::transport::RegisterClient;

/// What happened to one `(property, value)` pair of a delta.
#[derive(Debug)]
pub enum PairOutcome {
    /// The value was converted and written.
    Written { value: u16 },
    /// Desired state updated; the property is read-only so nothing was written.
    Recorded,
    /// The value equals the current desired value.
    Unchanged,
    /// The pair could not be applied. Other pairs are unaffected.
    Failed(ReconcileError),
}

#[derive(Debug)]
pub struct PairReport {
    pub property: String,
    pub outcome: PairOutcome,
}

/// Per-pair result of applying one delta message.
#[derive(Debug)]
pub struct ReconcileReport {
    pub device: String,
    pub pairs: Vec<PairReport>,
}

impl ReconcileReport {
    /// Outcome for a property, if the delta named it.
    pub fn outcome(&self, property: &str) -> Option<&PairOutcome> {
        self.pairs
            .iter()
            .find(|p| p.property == property)
            .map(|p| &p.outcome)
    }

    /// Number of register writes performed.
    pub fn writes(&self) -> usize {
        self.pairs
            .iter()
            .filter(|p| matches!(p.outcome, PairOutcome::Written { .. }))
            .count()
    }

    /// Number of pairs that failed.
    pub fn failures(&self) -> usize {
        self.pairs
            .iter()
            .filter(|p| matches!(p.outcome, PairOutcome::Failed(_)))
            .count()
    }
}

/// Applies inbound deltas to registry entries, writing writable properties
/// through the device's client.
pub struct Reconciler {
    registry: Arc<Registry>,
}

impl Reconciler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Handle a raw delta message as received on the bus.
    pub async fn handle_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<ReconcileReport, ReconcileError> {
        let device_id =
            parse_delta_topic(topic).ok_or_else(|| ReconcileError::Topic(topic.to_string()))?;

        let delta: DeviceTwinDelta =
            decode(payload).map_err(|e| ReconcileError::Payload(e.to_string()))?;

        self.apply(device_id, &delta).await
    }

    /// Apply a delta to a device. Pairs are processed independently.
    pub async fn apply(
        &self,
        device_id: &str,
        delta: &DeviceTwinDelta,
    ) -> Result<ReconcileReport, ReconcileError> {
        let device = self
            .registry
            .get(device_id)
            .ok_or_else(|| ReconcileError::DeviceNotFound(device_id.to_string()))?;

        let mut pairs = Vec::with_capacity(delta.delta.len());
        for (property, value) in &delta.delta {
            let outcome = match apply_pair(device, property, value).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Device '{}': cannot apply '{}' = '{}': {}", device_id, property, value, e);
                    PairOutcome::Failed(e)
                }
            };
            pairs.push(PairReport {
                property: property.clone(),
                outcome,
            });
        }

        Ok(ReconcileReport {
            device: device_id.to_string(),
            pairs,
        })
    }
}

async fn apply_pair(
    device: &DeviceRuntime,
    property: &str,
    value: &str,
) -> Result<PairOutcome, ReconcileError> {
    let twin = device
        .instance()
        .twin(property)
        .ok_or_else(|| ReconcileError::TwinNotFound(property.to_string()))?;

    if !twin.update_desired(value) {
        return Ok(PairOutcome::Unchanged);
    }

    if twin.is_read_only() {
        debug!(
            "Device '{}': '{}' is read-only, desired value recorded only",
            device.id(),
            property
        );
        return Ok(PairOutcome::Recorded);
    }

    let client = device
        .client()
        .ok_or_else(|| ReconcileError::NotStarted(device.id().to_string()))?;

    let word = write_value(twin, value, client.as_ref()).await?;
    info!(
        "Device '{}': wrote {} to {} @ {} ('{}' = '{}')",
        device.id(),
        word,
        twin.visitor.bank,
        twin.visitor.offset,
        property,
        value
    );
    Ok(PairOutcome::Written { value: word })
}

/// Convert `value` to the twin's register word and write it.
///
/// Read-only twins are never written; the caller checks.
pub async fn write_value(
    twin: &Twin,
    value: &str,
    client: &dyn RegisterClient,
) -> Result<u16, ReconcileError> {
    let word = codec::encode(value, twin.data_type, &twin.visitor.layout)?;
    client
        .write(twin.visitor.bank, twin.visitor.offset, word)
        .await?;
    Ok(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DeviceProfile;
    use crate::transport::{MemoryClient, RegisterBank, WriteRecord};

    const PROFILE: &str = r#"{
        deviceInstances: [{
            id: "pump1", model: "pump-model", protocol: "tcp-1",
            twins: [
                { propertyName: "speed", desired: { value: "0" } },
                { propertyName: "temperature" },
                { propertyName: "label" },
            ],
            propertyVisitors: [
                { propertyName: "speed", visitorConfig: { register: "HoldingRegister", offset: 10 } },
                { propertyName: "temperature", visitorConfig: { register: "InputRegister", offset: 0 } },
                { propertyName: "label", visitorConfig: { register: "HoldingRegister", offset: 20, limit: 4 } },
            ],
        }],
        deviceModels: [{
            name: "pump-model",
            properties: [
                { name: "speed", dataType: "int", accessMode: "ReadWrite" },
                { name: "temperature", dataType: "float", accessMode: "ReadOnly" },
                { name: "label", dataType: "string", accessMode: "ReadWrite" },
            ],
        }],
        protocols: [{ name: "tcp-1", protocolCommonConfig: { tcp: { ip: "127.0.0.1" } } }],
    }"#;

    fn setup() -> (Reconciler, Arc<Registry>, Arc<MemoryClient>) {
        let registry =
            Arc::new(Registry::from_profile(DeviceProfile::parse(PROFILE).unwrap()).unwrap());
        let client = Arc::new(MemoryClient::new());
        registry.get("pump1").unwrap().attach_client(client.clone());
        (Reconciler::new(registry.clone()), registry, client)
    }

    fn desired(registry: &Registry, property: &str) -> String {
        registry
            .get("pump1")
            .unwrap()
            .instance()
            .twin(property)
            .unwrap()
            .desired()
    }

    #[tokio::test]
    async fn test_delta_writes_once() {
        let (reconciler, registry, client) = setup();
        let delta = DeviceTwinDelta::from_pairs([("speed", "42")]);

        let report = reconciler.apply("pump1", &delta).await.unwrap();
        assert!(matches!(
            report.outcome("speed"),
            Some(PairOutcome::Written { value: 42 })
        ));
        assert_eq!(desired(&registry, "speed"), "42");
        assert_eq!(
            client.writes(),
            vec![WriteRecord {
                bank: RegisterBank::Holding,
                offset: 10,
                value: 42
            }]
        );

        let report = reconciler.apply("pump1", &delta).await.unwrap();
        assert!(matches!(report.outcome("speed"), Some(PairOutcome::Unchanged)));
        assert_eq!(report.writes(), 0);
        assert_eq!(client.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_read_only_never_written() {
        let (reconciler, registry, client) = setup();
        let delta = DeviceTwinDelta::from_pairs([("temperature", "21.5")]);

        let report = reconciler.apply("pump1", &delta).await.unwrap();
        assert!(matches!(report.outcome("temperature"), Some(PairOutcome::Recorded)));
        assert_eq!(desired(&registry, "temperature"), "21.5");
        assert!(client.writes().is_empty());
    }

    #[tokio::test]
    async fn test_pairs_are_independent() {
        let (reconciler, registry, client) = setup();
        let delta = DeviceTwinDelta::from_pairs([
            ("label", "hello"),
            ("missing", "1"),
            ("speed", "7"),
        ]);

        let report = reconciler.apply("pump1", &delta).await.unwrap();
        assert!(matches!(
            report.outcome("missing"),
            Some(PairOutcome::Failed(ReconcileError::TwinNotFound(_)))
        ));
        assert!(matches!(
            report.outcome("label"),
            Some(PairOutcome::Failed(ReconcileError::Conversion(_)))
        ));
        assert!(matches!(
            report.outcome("speed"),
            Some(PairOutcome::Written { value: 7 })
        ));
        assert_eq!(report.failures(), 2);

        // The desired value is recorded even when conversion fails.
        assert_eq!(desired(&registry, "label"), "hello");
        assert_eq!(client.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let (reconciler, _, client) = setup();
        let delta = DeviceTwinDelta::from_pairs([("speed", "1")]);

        let result = reconciler.apply("pump9", &delta).await;
        assert!(matches!(result, Err(ReconcileError::DeviceNotFound(id)) if id == "pump9"));
        assert!(client.writes().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let (reconciler, registry, client) = setup();
        client.set_online(false);

        let delta = DeviceTwinDelta::from_pairs([("speed", "5")]);
        let report = reconciler.apply("pump1", &delta).await.unwrap();
        assert!(matches!(
            report.outcome("speed"),
            Some(PairOutcome::Failed(ReconcileError::Io(_)))
        ));

        // Not retried: the same value again is a no-op.
        client.set_online(true);
        let report = reconciler.apply("pump1", &delta).await.unwrap();
        assert!(matches!(report.outcome("speed"), Some(PairOutcome::Unchanged)));
        assert_eq!(desired(&registry, "speed"), "5");
        assert!(client.writes().is_empty());
    }

    #[tokio::test]
    async fn test_handle_message() {
        let (reconciler, _, client) = setup();
        let payload = br#"{"event_id":"e1","timestamp":1,"twin":{},"delta":{"speed":"3"}}"#;

        let report = reconciler
            .handle_message("hw/events/device/pump1/twin/update/delta", payload)
            .await
            .unwrap();
        assert_eq!(report.device, "pump1");
        assert_eq!(report.writes(), 1);
        assert_eq!(client.get(RegisterBank::Holding, 10), 3);

        let result = reconciler
            .handle_message("hw/events/device/pump1/twin/update/delta", b"not json")
            .await;
        assert!(matches!(result, Err(ReconcileError::Payload(_))));

        let result = reconciler.handle_message("hw/events/other", payload).await;
        assert!(matches!(result, Err(ReconcileError::Topic(_))));
    }

    #[tokio::test]
    async fn test_device_without_client() {
        let (reconciler, registry, _) = setup();
        registry.get("pump1").unwrap().release_client();

        let delta = DeviceTwinDelta::from_pairs([("speed", "9")]);
        let report = reconciler.apply("pump1", &delta).await.unwrap();
        assert!(matches!(
            report.outcome("speed"),
            Some(PairOutcome::Failed(ReconcileError::NotStarted(_)))
        ));
    }
}
