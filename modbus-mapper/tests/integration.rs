//! End-to-end tests: profile, orchestrator and in-memory bus and devices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mapper_common::{DeviceData, DeviceStateUpdate, DeviceTwinDelta, DeviceTwinUpdate};
use mapper_framework::{MemoryBus, publish_json};
use modbus_mapper::profile::DeviceProfile;
use modbus_mapper::registry::DeviceInstance;
use modbus_mapper::transport::{MemoryClient, RegisterBank, RegisterClient, WriteRecord};
use modbus_mapper::{
    BusNotifier, ConnectionError, Connector, Orchestrator, OrchestratorOptions, Registry,
};

const PROFILE: &str = r#"{
    deviceInstances: [
        {
            id: "pump1", name: "pump1", model: "pump-model", protocol: "tcp-pump",
            twins: [
                { propertyName: "speed", desired: { value: "0", metadata: { type: "int" } } },
                { propertyName: "pressure", desired: { value: "", metadata: { type: "float" } } },
            ],
            propertyVisitors: [
                {
                    propertyName: "speed",
                    visitorConfig: { register: "HoldingRegister", offset: 10, limit: 1 },
                },
                {
                    propertyName: "pressure",
                    visitorConfig: { register: "InputRegister", offset: 3, limit: 1, scale: 0.1 },
                },
            ],
        },
        {
            id: "shutter1", name: "shutter1", model: "modbus-rtu-shutter-model", protocol: "rtu-1",
            twins: [],
            propertyVisitors: [],
        },
        {
            id: "broken", name: "broken", model: "pump-model", protocol: "empty",
            twins: [{ propertyName: "speed" }],
            propertyVisitors: [
                { propertyName: "speed", visitorConfig: { register: "HoldingRegister", offset: 10 } },
            ],
        },
    ],
    deviceModels: [
        {
            name: "pump-model",
            properties: [
                { name: "speed", dataType: "int", accessMode: "ReadWrite" },
                { name: "pressure", dataType: "float", accessMode: "ReadOnly" },
            ],
        },
        { name: "modbus-rtu-shutter-model", properties: [] },
    ],
    protocols: [
        {
            name: "tcp-pump", protocol: "modbus",
            protocolConfig: { slaveID: 1 },
            protocolCommonConfig: { tcp: { ip: "192.168.1.20", port: 502 } },
        },
        {
            name: "rtu-1", protocol: "modbus",
            protocolConfig: { slaveID: 3 },
            protocolCommonConfig: {
                com: { serialPort: "/dev/ttyUSB0", baudRate: 9600, dataBits: 8, stopBits: 1, parity: "none" },
                customizedValues: { serialType: "RS485" },
            },
        },
        { name: "empty", protocol: "modbus" },
    ],
}"#;

/// Simulated devices keyed by device ID.
#[derive(Default)]
struct SimulatedPlant {
    devices: Mutex<HashMap<String, Arc<MemoryClient>>>,
}

impl SimulatedPlant {
    fn device(&self, id: &str) -> Arc<MemoryClient> {
        self.devices
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(MemoryClient::new()))
            .clone()
    }
}

#[async_trait]
impl Connector for SimulatedPlant {
    async fn open(
        &self,
        device: &DeviceInstance,
    ) -> Result<Arc<dyn RegisterClient>, ConnectionError> {
        device.protocol.link()?;
        Ok(self.device(&device.id))
    }
}

struct Mapper {
    orchestrator: Orchestrator,
    bus: MemoryBus,
    plant: Arc<SimulatedPlant>,
}

fn mapper() -> Mapper {
    let registry = Registry::from_profile(DeviceProfile::parse(PROFILE).unwrap()).unwrap();
    let bus = MemoryBus::new();
    let plant = Arc::new(SimulatedPlant::default());
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        Arc::new(bus.clone()),
        Arc::new(BusNotifier::new(Arc::new(bus.clone()))),
        OrchestratorOptions {
            node_name: "edge-1".to_string(),
            ..OrchestratorOptions::default()
        },
    )
    .with_connector(plant.clone());

    Mapper {
        orchestrator,
        bus,
        plant,
    }
}

fn reported(bus: &MemoryBus, device: &str, property: &str) -> Vec<String> {
    bus.published_on(&format!("hw/events/device/{}/twin/update", device))
        .iter()
        .filter_map(|m| {
            let update: DeviceTwinUpdate = serde_json::from_slice(&m.payload).unwrap();
            update
                .twin
                .get(property)
                .and_then(|t| t.actual.as_ref())
                .and_then(|v| v.value.clone())
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_delta_is_written_and_reported_back() {
    let m = mapper();
    let started = m.orchestrator.start_all().await;
    assert_eq!(started, ["pump1", "shutter1"]);

    let delta = DeviceTwinDelta::from_pairs([("speed", "42")]);
    publish_json(&m.bus, "hw/events/device/pump1/twin/update/delta", &delta)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let pump = m.plant.device("pump1");
    assert_eq!(
        pump.writes().last(),
        Some(&WriteRecord {
            bank: RegisterBank::Holding,
            offset: 10,
            value: 42
        })
    );
    assert_eq!(reported(&m.bus, "pump1", "speed"), ["42"]);

    m.orchestrator.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_delta_writes_once() {
    let m = mapper();
    m.orchestrator.start_all().await;
    let pump = m.plant.device("pump1");
    let initial_writes = pump.writes().len();

    for _ in 0..3 {
        let delta = DeviceTwinDelta::from_pairs([("speed", "42")]);
        publish_json(&m.bus, "hw/events/device/pump1/twin/update/delta", &delta)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(pump.writes().len(), initial_writes + 1);
    m.orchestrator.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_read_only_twin_is_sampled_not_written() {
    let m = mapper();
    m.orchestrator.start_all().await;
    let pump = m.plant.device("pump1");
    pump.set(RegisterBank::Input, 3, 253);
    let initial_writes = pump.writes().len();

    let delta = DeviceTwinDelta::from_pairs([("pressure", "99")]);
    publish_json(&m.bus, "hw/events/device/pump1/twin/update/delta", &delta)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(pump.writes().len(), initial_writes);
    let pressure = reported(&m.bus, "pump1", "pressure");
    assert_eq!(pressure.len(), 1);
    let value: f64 = pressure[0].parse().unwrap();
    assert!((value - 25.3).abs() < 1e-9);

    m.orchestrator.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutter_aggregate_published_as_data() {
    let m = mapper();
    m.orchestrator.start_all().await;
    let shutter = m.plant.device("shutter1");
    shutter.set(RegisterBank::Holding, 0, 1);
    shutter.set(RegisterBank::Holding, 1, 2);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let published = m.bus.published_on("hw/events/device/shutter1/data/update");
    assert_eq!(published.len(), 1);
    let data: DeviceData = serde_json::from_slice(&published[0].payload).unwrap();
    let channels: Vec<&str> = data.data["shutterAll"].value.split(',').collect();
    assert_eq!(channels.len(), 21);
    assert_eq!(&channels[..3], ["1", "2", "0"]);

    m.orchestrator.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_device_reported_and_isolated() {
    let m = mapper();
    m.orchestrator.start_all().await;

    // The device without a transport raised a notice at start.
    assert_eq!(m.bus.published_on("hw/events/device/broken/notice").len(), 1);

    let pump = m.plant.device("pump1");
    pump.set_online(false);
    tokio::time::sleep(Duration::from_millis(2100)).await;

    let states: Vec<String> = m
        .bus
        .published_on("hw/events/device/pump1/state/update")
        .iter()
        .map(|msg| {
            serde_json::from_slice::<DeviceStateUpdate>(&msg.payload)
                .unwrap()
                .state
        })
        .collect();
    assert_eq!(states, ["offline", "offline"]);
    assert_eq!(m.bus.published_on("hw/events/device/pump1/notice").len(), 1);

    // The shutter keeps reporting while the pump is down.
    assert_eq!(
        m.bus
            .published_on("hw/events/device/shutter1/data/update")
            .len(),
        2
    );

    m.orchestrator.stop_all().await;
    assert!(pump.is_closed());
}

#[test]
fn test_sample_files_load() {
    let root = concat!(env!("CARGO_MANIFEST_DIR"), "/../configs");

    let registry = Registry::load(format!("{}/deviceProfile.json", root)).unwrap();
    assert_eq!(registry.ids(), ["pump-01", "shutter-01"]);
    let shutter = registry.get("shutter-01").unwrap().instance();
    assert_eq!(shutter.aggregates.len(), 1);
    assert!(shutter.protocol.serial.rs485);

    let config = <modbus_mapper::ModbusMapperConfig as mapper_framework::MapperConfig>::load(
        format!("{}/modbus-mapper.json5", root),
    )
    .unwrap();
    assert_eq!(config.mapper.timeout_ms, 5000);
}
