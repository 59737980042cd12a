//! Modbus device mapper.
//!
//! Bridges Modbus devices (RTU/serial or TCP) to a device-twin message bus.
//! Desired-state deltas are written to device registers, register values are
//! sampled and published as reported state, and device reachability is
//! probed and published every second.
//!
//! # Topics
//!
//! ```text
//! hw/events/device/<id>/twin/update/delta   (subscribed)  desired-state deltas
//! hw/events/device/<id>/twin/update         (published)   reported twin values
//! hw/events/device/<id>/data/update         (published)   aggregate sensor data
//! hw/events/device/<id>/state/update        (published)   "online" / "offline"
//! hw/events/device/<id>/notice              (published)   unreachable notices
//! ```
//!
//! On MQTT every topic is prefixed with `$` as KubeEdge expects.

pub mod codec;
pub mod config;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod probe;
pub mod profile;
pub mod reconciler;
pub mod registry;
pub mod sampler;
pub mod transport;

pub use config::{MapperSettings, ModbusMapperConfig, NoticeSink};
pub use error::{ConfigError, ConnectionError, IoError, ReconcileError, SampleError, StartError};
pub use notify::{BusNotifier, DeviceNotice, LogNotifier, Notifier};
pub use orchestrator::{Connector, ModbusConnector, Orchestrator, OrchestratorOptions};
pub use reconciler::{PairOutcome, ReconcileReport, Reconciler};
pub use registry::{DeviceRuntime, Registry};
