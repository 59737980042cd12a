//! In-process message bus.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{InboundMessage, MessageBus, SUBSCRIPTION_CAPACITY, Subscription, topic_matches};
use crate::error::Result;

#[derive(Debug, Default)]
struct Inner {
    published: Mutex<Vec<InboundMessage>>,
    routes: Mutex<Vec<(String, mpsc::Sender<InboundMessage>)>>,
}

/// A bus that delivers messages within the process and records every
/// publication. Cloning yields a handle to the same bus.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, oldest first.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages published on exactly `topic`.
    pub fn published_on(&self, topic: &str) -> Vec<InboundMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Forget recorded publications.
    pub fn clear(&self) {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let message = InboundMessage {
            topic: topic.to_string(),
            payload,
        };

        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());

        let targets: Vec<mpsc::Sender<InboundMessage>> = {
            let mut routes = self
                .inner
                .routes
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            routes.retain(|(_, tx)| !tx.is_closed());
            routes
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        for tx in targets {
            let _ = tx.send(message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.inner
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), tx));
        Ok(Subscription::new(topic, rx))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
