//! Zenoh-backed message bus.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use zenoh::Session;

use mapper_common::ZenohConfig;

use super::{InboundMessage, MessageBus, SUBSCRIPTION_CAPACITY, Subscription};
use crate::error::{MapperError, Result};

/// Message bus over a Zenoh session.
///
/// Topics map one-to-one onto Zenoh key expressions. MQTT-style wildcards in
/// subscription filters are translated (`+` to `*`, `#` to `**`).
#[derive(Clone, Debug)]
pub struct ZenohBus {
    session: Arc<Session>,
}

impl ZenohBus {
    /// Open a session with the given settings.
    pub async fn connect(config: &ZenohConfig) -> Result<Self> {
        let session = mapper_common::connect(config)
            .await
            .map_err(|e| MapperError::BusConnection(e.to_string()))?;
        Ok(Self::from_session(Arc::new(session)))
    }

    /// Wrap an already open session.
    pub fn from_session(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

#[async_trait]
impl MessageBus for ZenohBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.session
            .put(topic, payload)
            .await
            .map_err(|e| MapperError::publish(topic, e))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let subscriber = self
            .session
            .declare_subscriber(key_expr_for(topic))
            .await
            .map_err(|e| MapperError::subscribe(topic, e))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let filter = topic.to_string();
        tokio::spawn(async move {
            while let Ok(sample) = subscriber.recv_async().await {
                let message = InboundMessage {
                    topic: sample.key_expr().as_str().to_string(),
                    payload: sample.payload().to_bytes().into_owned(),
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            tracing::debug!(topic = %filter, "Zenoh subscription ended");
        });

        tracing::info!(topic = %topic, "Subscribed");
        Ok(Subscription::new(topic, rx))
    }

    async fn close(&self) -> Result<()> {
        self.session
            .close()
            .await
            .map_err(|e| MapperError::BusConnection(e.to_string()))
    }
}

/// Translate an MQTT topic filter into a Zenoh key expression.
fn key_expr_for(filter: &str) -> String {
    filter
        .split('/')
        .map(|level| match level {
            "+" => "*",
            "#" => "**",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}
