//! One request at a time per device.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{LinkState, RegisterBank, RegisterClient};
use crate::error::IoError;

/// Serializes every read, write and probe sent to the wrapped client.
///
/// The sampler, the status probe and the reconciler of a device all share
/// one client; this makes their requests queue instead of interleaving on
/// the line.
pub struct SingleFlight {
    inner: Arc<dyn RegisterClient>,
    gate: Mutex<()>,
}

impl SingleFlight {
    pub fn new(inner: Arc<dyn RegisterClient>) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }
}

#[async_trait]
impl RegisterClient for SingleFlight {
    async fn read(
        &self,
        bank: RegisterBank,
        offset: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, IoError> {
        let _gate = self.gate.lock().await;
        self.inner.read(bank, offset, quantity).await
    }

    async fn write(&self, bank: RegisterBank, offset: u16, value: u16) -> Result<(), IoError> {
        let _gate = self.gate.lock().await;
        self.inner.write(bank, offset, value).await
    }

    async fn probe(&self) -> LinkState {
        let _gate = self.gate.lock().await;
        self.inner.probe().await
    }

    // Not gated: closing must not wait behind a request that is timing out.
    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryClient;
    use std::time::Duration;

    async fn mixed_load(client: Arc<dyn RegisterClient>) {
        let mut handles = Vec::new();
        for i in 0..8u16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                match i % 3 {
                    0 => client.write(RegisterBank::Holding, i, i).await.unwrap(),
                    1 => {
                        client.read(RegisterBank::Holding, i, 1).await.unwrap();
                    }
                    _ => assert_eq!(client.probe().await, LinkState::Online),
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_never_overlap() {
        let device = Arc::new(MemoryClient::new().with_latency(Duration::from_millis(10)));

        mixed_load(Arc::new(SingleFlight::new(device.clone()))).await;

        assert_eq!(device.max_in_flight(), 1);
        assert_eq!(device.writes().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwrapped_client_overlaps() {
        let device = Arc::new(MemoryClient::new().with_latency(Duration::from_millis(10)));

        mixed_load(device.clone()).await;

        assert!(device.max_in_flight() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_does_not_wait_for_requests() {
        let device = Arc::new(MemoryClient::new().with_latency(Duration::from_secs(5)));
        let client = Arc::new(SingleFlight::new(device.clone()));

        let reader = client.clone();
        let pending =
            tokio::spawn(async move { reader.read(RegisterBank::Holding, 0, 1).await });
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        client.close().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(device.is_closed());

        // The device answers the in-flight read with a closed link.
        assert!(matches!(pending.await.unwrap(), Err(IoError::Closed)));
    }
}
