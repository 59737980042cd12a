//! Publish/subscribe message bus abstraction.
//!
//! The mapper talks to the cloud side through a [`MessageBus`]. Three
//! backends are provided:
//! - [`ZenohBus`] - a Zenoh session (default)
//! - [`MqttBus`] - an MQTT broker, the usual edge event bus
//! - [`MemoryBus`] - an in-process bus for tests and local runs

mod memory;
mod mqtt;
mod zenoh_session;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use mapper_common::{BaseConfig, BusBackend};

use crate::error::Result;

pub use self::memory::MemoryBus;
pub use self::mqtt::MqttBus;
pub use self::zenoh_session::ZenohBus;

/// Capacity of the per-subscription delivery queue.
pub const SUBSCRIPTION_CAPACITY: usize = 64;

/// A message delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on (without any wire prefix).
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Receiving end of a subscription.
///
/// Messages are delivered in publication order. Dropping the subscription
/// stops delivery.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<InboundMessage>,
}

impl Subscription {
    pub(crate) fn new(topic: impl Into<String>, rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// The topic filter this subscription was created with.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message. Returns `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

/// A publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish raw bytes on a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared handle to a message bus.
pub type SharedBus = Arc<dyn MessageBus>;

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn MessageBus,
    topic: &str,
    value: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    bus.publish(topic, payload).await
}

/// Connect the backend selected in `config`.
pub async fn connect_bus(config: &BaseConfig) -> Result<SharedBus> {
    match config.bus.backend {
        BusBackend::Zenoh => Ok(Arc::new(ZenohBus::connect(&config.zenoh).await?)),
        BusBackend::Mqtt => Ok(Arc::new(MqttBus::connect(&config.mqtt)?)),
    }
}

/// Match a topic against a filter using MQTT wildcard rules
/// (`+` matches one level, a trailing `#` matches the rest).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
