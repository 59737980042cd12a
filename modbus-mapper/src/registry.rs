//! Device registry built from a device profile.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::codec::{DataType, RegisterLayout};
use crate::error::ConfigError;
use crate::profile::{AggregateSpec, DeviceProfile, InstanceSpec, ModelSpec};
use crate::transport::{ProtocolConfig, RegisterBank, RegisterClient};

/// Sample interval used when a collect cycle is unset or zero.
pub const DEFAULT_COLLECT_CYCLE: Duration = Duration::from_secs(1);

/// Whether the cloud may write a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl FromStr for AccessMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ReadOnly" => Ok(AccessMode::ReadOnly),
            "ReadWrite" => Ok(AccessMode::ReadWrite),
            _ => Err(ConfigError::Validation(format!(
                "unknown access mode '{}' (use ReadOnly or ReadWrite)",
                s
            ))),
        }
    }
}

/// Turn a collect cycle in nanoseconds into a sample period.
pub fn collect_period(nanos: u64) -> Duration {
    if nanos == 0 {
        DEFAULT_COLLECT_CYCLE
    } else {
        Duration::from_nanos(nanos)
    }
}

/// Where and how a twin lives in the device's registers.
#[derive(Debug, Clone, PartialEq)]
pub struct Visitor {
    pub bank: RegisterBank,
    pub offset: u16,
    /// Number of registers read per sample.
    pub limit: u16,
    pub layout: RegisterLayout,
    pub access: AccessMode,
    /// Sample period (already defaulted).
    pub period: Duration,
}

#[derive(Debug, Clone, Default)]
struct TwinState {
    desired: String,
    reported: String,
}

/// One monitorable or controllable property of a device.
///
/// `desired` is changed only by the reconciler, `reported` only by the
/// sampler after a successful read.
#[derive(Debug)]
pub struct Twin {
    pub property_name: String,
    pub data_type: DataType,
    /// Type name reported alongside values.
    pub value_type: String,
    pub visitor: Visitor,
    state: RwLock<TwinState>,
}

impl Twin {
    pub fn new(
        property_name: impl Into<String>,
        data_type: DataType,
        visitor: Visitor,
        desired: impl Into<String>,
    ) -> Self {
        Self {
            property_name: property_name.into(),
            data_type,
            value_type: data_type.as_str().to_string(),
            visitor,
            state: RwLock::new(TwinState {
                desired: desired.into(),
                reported: String::new(),
            }),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.visitor.access == AccessMode::ReadOnly
    }

    pub fn desired(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .desired
            .clone()
    }

    pub fn reported(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .reported
            .clone()
    }

    /// Replace the desired value unless it is literally equal.
    /// Returns whether it changed.
    pub(crate) fn update_desired(&self, value: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.desired == value {
            return false;
        }
        state.desired = value.to_string();
        true
    }

    pub(crate) fn set_reported(&self, value: String) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .reported = value;
    }
}

/// A model-level sensor read as a block and published as data.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub name: String,
    pub data_type: DataType,
    pub bank: RegisterBank,
    pub offset: u16,
    pub limit: u16,
    pub period: Duration,
}

/// Aggregates every device of a known model carries.
pub fn builtin_aggregates(model: &str) -> Vec<Aggregate> {
    match model {
        "modbus-rtu-shutter-model" => vec![Aggregate {
            name: "shutterAll".to_string(),
            data_type: DataType::Float,
            bank: RegisterBank::Holding,
            offset: 0,
            limit: 21,
            period: DEFAULT_COLLECT_CYCLE,
        }],
        "modbus-rtu-snow-model" => vec![Aggregate {
            name: "snow".to_string(),
            data_type: DataType::Float,
            bank: RegisterBank::Holding,
            offset: 22,
            limit: 1,
            period: DEFAULT_COLLECT_CYCLE,
        }],
        _ => Vec::new(),
    }
}

/// Static definition of a device. Immutable after load apart from twin state.
#[derive(Debug)]
pub struct DeviceInstance {
    pub id: String,
    pub name: String,
    pub model: String,
    pub protocol: ProtocolConfig,
    pub twins: Vec<Arc<Twin>>,
    pub aggregates: Vec<Aggregate>,
}

impl DeviceInstance {
    /// Look up a twin by property name.
    pub fn twin(&self, property_name: &str) -> Option<&Arc<Twin>> {
        self.twins.iter().find(|t| t.property_name == property_name)
    }
}

/// A device and its open client, if started.
pub struct DeviceRuntime {
    instance: DeviceInstance,
    client: Mutex<Option<Arc<dyn RegisterClient>>>,
}

impl DeviceRuntime {
    pub fn new(instance: DeviceInstance) -> Self {
        Self {
            instance,
            client: Mutex::new(None),
        }
    }

    pub fn instance(&self) -> &DeviceInstance {
        &self.instance
    }

    pub fn id(&self) -> &str {
        &self.instance.id
    }

    /// The open client, if the device is started.
    pub fn client(&self) -> Option<Arc<dyn RegisterClient>> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn attach_client(&self, client: Arc<dyn RegisterClient>) {
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
    }

    pub(crate) fn release_client(&self) -> Option<Arc<dyn RegisterClient>> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Device ID to runtime map. Built once and never partially.
#[derive(Default)]
pub struct Registry {
    devices: BTreeMap<String, Arc<DeviceRuntime>>,
}

impl Registry {
    /// Load and validate a device profile file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_profile(DeviceProfile::load(path)?)
    }

    /// Build the registry from a parsed profile.
    pub fn from_profile(profile: DeviceProfile) -> Result<Self, ConfigError> {
        let models: HashMap<&str, &ModelSpec> = profile
            .device_models
            .iter()
            .map(|m| (m.name.as_str(), m))
            .collect();

        let mut protocols = HashMap::new();
        for spec in &profile.protocols {
            if !spec.protocol.is_empty() && !spec.protocol.eq_ignore_ascii_case("modbus") {
                return Err(ConfigError::Validation(format!(
                    "protocol '{}' uses unsupported protocol type '{}'",
                    spec.name, spec.protocol
                )));
            }
            protocols.insert(spec.name.as_str(), ProtocolConfig::from_spec(spec));
        }

        let mut devices = BTreeMap::new();
        for spec in &profile.device_instances {
            if devices.contains_key(&spec.id) {
                return Err(ConfigError::DuplicateDevice(spec.id.clone()));
            }

            let model = models
                .get(spec.model.as_str())
                .ok_or_else(|| ConfigError::UnknownModel {
                    device: spec.id.clone(),
                    model: spec.model.clone(),
                })?;

            let protocol = protocols
                .get(spec.protocol.as_str())
                .cloned()
                .ok_or_else(|| ConfigError::UnknownProtocol {
                    device: spec.id.clone(),
                    protocol: spec.protocol.clone(),
                })?;

            let instance = build_instance(spec, model, protocol)?;
            debug!(
                "Registered device '{}' ({} twins, {} aggregates)",
                instance.id,
                instance.twins.len(),
                instance.aggregates.len()
            );
            devices.insert(spec.id.clone(), Arc::new(DeviceRuntime::new(instance)));
        }

        Ok(Self { devices })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<DeviceRuntime>> {
        self.devices.get(id)
    }

    /// Device IDs in ascending order.
    pub fn ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceRuntime>> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn build_instance(
    spec: &InstanceSpec,
    model: &ModelSpec,
    protocol: ProtocolConfig,
) -> Result<DeviceInstance, ConfigError> {
    let invalid = |what: String| ConfigError::Validation(format!("Device '{}': {}", spec.id, what));

    let mut seen = HashSet::new();
    let mut twins = Vec::with_capacity(spec.twins.len());

    for twin_spec in &spec.twins {
        let name = &twin_spec.property_name;
        if !seen.insert(name.as_str()) {
            return Err(invalid(format!("duplicate twin '{}'", name)));
        }

        let visitor_spec = spec
            .property_visitors
            .iter()
            .find(|v| &v.property_name == name)
            .ok_or_else(|| ConfigError::MissingVisitor {
                device: spec.id.clone(),
                twin: name.clone(),
            })?;

        let property = model
            .properties
            .iter()
            .find(|p| &p.name == name)
            .ok_or_else(|| ConfigError::UndeclaredProperty {
                device: spec.id.clone(),
                property: name.clone(),
                model: model.name.clone(),
            })?;

        let data_type: DataType = property
            .data_type
            .parse()
            .map_err(|e| invalid(format!("property '{}': {}", name, e)))?;
        let access: AccessMode = property
            .access_mode
            .parse()
            .map_err(|e| invalid(format!("property '{}': {}", name, e)))?;

        let config = &visitor_spec.visitor_config;
        let bank: RegisterBank = config
            .register
            .parse()
            .map_err(|e| invalid(format!("property '{}': {}", name, e)))?;
        if config.limit == 0 {
            return Err(invalid(format!("property '{}': limit must be at least 1", name)));
        }

        let visitor = Visitor {
            bank,
            offset: config.offset,
            limit: config.limit,
            layout: RegisterLayout {
                scale: config.scale,
                byte_swap: config.is_swap,
                word_swap: config.is_register_swap,
            },
            access,
            period: collect_period(visitor_spec.collect_cycle),
        };

        let mut twin = Twin::new(name.clone(), data_type, visitor, &twin_spec.desired.value);
        if !twin_spec.desired.metadata.value_type.is_empty() {
            twin.value_type = twin_spec.desired.metadata.value_type.clone();
        }
        twins.push(Arc::new(twin));
    }

    // Visitors must refer to properties the model declares.
    for visitor in &spec.property_visitors {
        if !model.properties.iter().any(|p| p.name == visitor.property_name) {
            return Err(ConfigError::UndeclaredProperty {
                device: spec.id.clone(),
                property: visitor.property_name.clone(),
                model: model.name.clone(),
            });
        }
    }

    let mut aggregates = builtin_aggregates(&model.name);
    for aggregate in &model.aggregates {
        aggregates.push(build_aggregate(aggregate).map_err(invalid)?);
    }

    Ok(DeviceInstance {
        id: spec.id.clone(),
        name: spec.name.clone(),
        model: spec.model.clone(),
        protocol,
        twins,
        aggregates,
    })
}

fn build_aggregate(spec: &AggregateSpec) -> Result<Aggregate, String> {
    let data_type: DataType = spec
        .data_type
        .parse()
        .map_err(|e| format!("aggregate '{}': {}", spec.name, e))?;
    let bank: RegisterBank = spec
        .register
        .parse()
        .map_err(|e| format!("aggregate '{}': {}", spec.name, e))?;

    if spec.limit == 0 {
        return Err(format!("aggregate '{}': limit must be at least 1", spec.name));
    }

    Ok(Aggregate {
        name: spec.name.clone(),
        data_type,
        bank,
        offset: spec.offset,
        limit: spec.limit,
        period: collect_period(spec.collect_cycle),
    })
}
