//! MQTT-backed message bus.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use mapper_common::MqttConfig;

use super::{InboundMessage, MessageBus, SUBSCRIPTION_CAPACITY, Subscription, topic_matches};
use crate::error::{MapperError, Result};

/// Capacity of the rumqttc request queue.
const REQUEST_CAPACITY: usize = 64;

/// Delay before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type Routes = Arc<Mutex<Vec<(String, mpsc::Sender<InboundMessage>)>>>;

/// Message bus over an MQTT broker.
///
/// Every topic is prefixed with `topic_prefix` on the wire, so device topics
/// appear as `$hw/events/...` with the default configuration. Subscriptions
/// are re-issued after each reconnect.
pub struct MqttBus {
    client: AsyncClient,
    prefix: String,
    routes: Routes,
    event_loop: JoinHandle<()>,
}

impl MqttBus {
    /// Create the client and start its event loop.
    ///
    /// The broker connection is established lazily by the event loop;
    /// failures are logged and retried.
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(MapperError::BusConnection(
                "MQTT host cannot be empty".to_string(),
            ));
        }

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let routes: Routes = Arc::new(Mutex::new(Vec::new()));

        tracing::info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "Connecting to MQTT broker"
        );

        let event_loop = tokio::spawn(drive_event_loop(
            event_loop,
            client.clone(),
            routes.clone(),
            config.topic_prefix.clone(),
        ));

        Ok(Self {
            client,
            prefix: config.topic_prefix.clone(),
            routes,
            event_loop,
        })
    }

    fn wire_topic(&self, topic: &str) -> String {
        format!("{}{}", self.prefix, topic)
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let wire = self.wire_topic(topic);
        self.client
            .publish(wire.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MapperError::publish(wire, e))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), tx));

        let wire = self.wire_topic(topic);
        self.client
            .subscribe(wire.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| MapperError::subscribe(wire, e))?;

        tracing::info!(topic = %topic, "Subscribed");
        Ok(Subscription::new(topic, rx))
    }

    async fn close(&self) -> Result<()> {
        let result = self.client.disconnect().await;
        self.event_loop.abort();
        result.map_err(|e| MapperError::BusConnection(e.to_string()))
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    routes: Routes,
    prefix: String,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("MQTT connected");
                let filters: Vec<String> = routes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|(filter, _)| format!("{}{}", prefix, filter))
                    .collect();
                for filter in filters {
                    if let Err(e) = client.subscribe(filter.as_str(), QoS::AtLeastOnce).await {
                        tracing::warn!(topic = %filter, error = %e, "Failed to resubscribe");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = publish
                    .topic
                    .strip_prefix(prefix.as_str())
                    .unwrap_or(&publish.topic)
                    .to_string();
                dispatch(&routes, topic, publish.payload.to_vec());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "MQTT connection error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Hand a message to every matching subscription and return how many took it.
///
/// Never waits: a subscriber whose queue is full loses the message, so one
/// slow device cannot stall delivery to the others or the event loop.
fn dispatch(routes: &Routes, topic: String, payload: Vec<u8>) -> usize {
    let targets: Vec<mpsc::Sender<InboundMessage>> = {
        let mut routes = routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.retain(|(_, tx)| !tx.is_closed());
        routes
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &topic))
            .map(|(_, tx)| tx.clone())
            .collect()
    };

    let mut delivered = 0;
    for tx in targets {
        let message = InboundMessage {
            topic: topic.clone(),
            payload: payload.clone(),
        };
        match tx.try_send(message) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(topic = %topic, "Subscriber queue full, message dropped");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(topic = %topic, "Subscriber dropped");
            }
        }
    }
    delivered
}
