//! In-memory register client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{LinkState, RegisterBank, RegisterClient};
use crate::error::IoError;

/// A register write observed by a [`MemoryClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub bank: RegisterBank,
    pub offset: u16,
    pub value: u16,
}

#[derive(Debug, Default)]
struct Registers {
    words: HashMap<(RegisterBank, u16), u16>,
    writes: Vec<WriteRecord>,
    reads: usize,
}

/// A device simulated in memory.
///
/// Written registers read back unchanged, unset registers read as zero.
/// Requests are not serialized: like a device on a shared line, the client
/// only records the deepest request overlap it has seen. Wrap it in
/// [`SingleFlight`](super::SingleFlight) to serialize.
#[derive(Debug)]
pub struct MemoryClient {
    registers: Mutex<Registers>,
    latency: Duration,
    online: AtomicBool,
    closed: AtomicBool,
    pending_failures: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self {
            registers: Mutex::new(Registers::default()),
            latency: Duration::ZERO,
            online: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            pending_failures: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make every request take `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn registers(&self) -> std::sync::MutexGuard<'_, Registers> {
        self.registers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a register without recording a write.
    pub fn set(&self, bank: RegisterBank, offset: u16, value: u16) {
        self.registers().words.insert((bank, offset), value);
    }

    /// Current register value.
    pub fn get(&self, bank: RegisterBank, offset: u16) -> u16 {
        self.registers()
            .words
            .get(&(bank, offset))
            .copied()
            .unwrap_or(0)
    }

    /// Writes received so far, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.registers().writes.clone()
    }

    /// Number of successful reads.
    pub fn read_count(&self) -> usize {
        self.registers().reads
    }

    /// Simulate the device dropping off (or coming back).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Fail the next `count` reads with a transport error.
    pub fn fail_next_reads(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Deepest request overlap observed. Stays at 1 while callers serialize
    /// their requests.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_link(&self) -> Result<(), IoError> {
        if self.is_closed() {
            return Err(IoError::Closed);
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(IoError::Transport("device offline".to_string()));
        }
        Ok(())
    }

    async fn request<T>(&self, op: impl FnOnce() -> Result<T, IoError>) -> Result<T, IoError> {
        let depth = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(depth, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = op();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl RegisterClient for MemoryClient {
    async fn read(
        &self,
        bank: RegisterBank,
        offset: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, IoError> {
        self.request(|| {
            self.check_link()?;

            let failing = self
                .pending_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(IoError::Transport("injected failure".to_string()));
            }

            let mut registers = self.registers();
            registers.reads += 1;
            Ok((0..quantity)
                .map(|i| {
                    registers
                        .words
                        .get(&(bank, offset.wrapping_add(i)))
                        .copied()
                        .unwrap_or(0)
                })
                .collect())
        })
        .await
    }

    async fn write(&self, bank: RegisterBank, offset: u16, value: u16) -> Result<(), IoError> {
        self.request(|| {
            self.check_link()?;

            let value = match bank {
                RegisterBank::Holding => value,
                RegisterBank::Coil => u16::from(value != 0),
                RegisterBank::DiscreteInput | RegisterBank::Input => {
                    return Err(IoError::NotWritable(bank));
                }
            };

            let mut registers = self.registers();
            registers.words.insert((bank, offset), value);
            registers.writes.push(WriteRecord {
                bank,
                offset,
                value,
            });
            Ok(())
        })
        .await
    }

    async fn probe(&self) -> LinkState {
        match self.request(|| self.check_link()).await {
            Ok(()) => LinkState::Online,
            Err(_) => LinkState::Offline,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_write_reads_back() {
        let client = MemoryClient::new();
        client.write(RegisterBank::Holding, 10, 42).await.unwrap();

        let words = client.read(RegisterBank::Holding, 10, 2).await.unwrap();
        assert_eq!(words, vec![42, 0]);
        assert_eq!(
            client.writes(),
            vec![WriteRecord {
                bank: RegisterBank::Holding,
                offset: 10,
                value: 42
            }]
        );
    }

    #[tokio::test]
    async fn test_input_banks_reject_writes() {
        let client = MemoryClient::new();
        let result = client.write(RegisterBank::Input, 0, 1).await;
        assert!(matches!(result, Err(IoError::NotWritable(RegisterBank::Input))));
        assert!(client.writes().is_empty());
    }

    #[tokio::test]
    async fn test_offline_and_injected_failures() {
        let client = MemoryClient::new();
        client.fail_next_reads(1);
        assert!(client.read(RegisterBank::Holding, 0, 1).await.is_err());
        assert!(client.read(RegisterBank::Holding, 0, 1).await.is_ok());

        client.set_online(false);
        assert_eq!(client.probe().await, LinkState::Offline);
        client.set_online(true);
        assert_eq!(client.probe().await, LinkState::Online);

        client.close().await;
        assert!(matches!(
            client.read(RegisterBank::Holding, 0, 1).await,
            Err(IoError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_overlapping_requests() {
        let client = Arc::new(MemoryClient::new().with_latency(Duration::from_millis(10)));

        let mut handles = Vec::new();
        for i in 0..4u16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.read(RegisterBank::Holding, i, 1).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(client.max_in_flight(), 4);
        assert_eq!(client.read_count(), 4);
    }
}
