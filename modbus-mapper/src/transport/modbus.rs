//! `tokio-modbus` backed register client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use super::{Link, LinkState, RegisterBank, RegisterClient, SerialSettings, TransportOptions};
use crate::error::{ConnectionError, IoError};

/// A Modbus RTU or TCP client.
///
/// The connection context sits behind an async mutex, so requests from the
/// sampler, the status probe and the reconciler are serialized. A request
/// that fails at the link level drops the context; the next request or
/// probe reconnects.
pub struct ModbusClient {
    link: Link,
    slave: Slave,
    timeout: Duration,
    context: Mutex<Option<Context>>,
    closed: AtomicBool,
}

impl ModbusClient {
    /// Connect to the device behind `link`.
    pub async fn connect(
        link: Link,
        slave_id: u8,
        options: &TransportOptions,
    ) -> Result<Self, ConnectionError> {
        let slave = Slave(slave_id);
        let context = connect_link(&link, slave, options.timeout).await?;

        info!("Connected to {} (slave {})", link, slave_id);

        Ok(Self {
            link,
            slave,
            timeout: options.timeout,
            context: Mutex::new(Some(context)),
            closed: AtomicBool::new(false),
        })
    }

    /// The transport this client talks over.
    pub fn link(&self) -> &Link {
        &self.link
    }

    async fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<Context>,
    ) -> Result<&'a mut Context, IoError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IoError::Closed);
        }

        if slot.is_none() {
            debug!("Reconnecting to {}", self.link);
            *slot = Some(connect_link(&self.link, self.slave, self.timeout).await?);
        }

        slot.as_mut().ok_or(IoError::Closed)
    }

    fn settle<T>(
        &self,
        slot: &mut Option<Context>,
        result: Result<Result<T, IoError>, tokio::time::error::Elapsed>,
    ) -> Result<T, IoError> {
        let result = result.unwrap_or_else(|_| Err(IoError::Timeout(self.timeout)));

        if let Err(e) = &result {
            if e.is_link_failure() {
                warn!("Dropping connection to {}: {}", self.link, e);
                *slot = None;
            }
        }

        result
    }
}

#[async_trait]
impl RegisterClient for ModbusClient {
    async fn read(
        &self,
        bank: RegisterBank,
        offset: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, IoError> {
        let mut slot = self.context.lock().await;
        let ctx = self.ensure_connected(&mut slot).await?;
        let result = tokio::time::timeout(self.timeout, read_bank(ctx, bank, offset, quantity)).await;
        self.settle(&mut slot, result)
    }

    async fn write(&self, bank: RegisterBank, offset: u16, value: u16) -> Result<(), IoError> {
        let mut slot = self.context.lock().await;
        let ctx = self.ensure_connected(&mut slot).await?;
        let result = tokio::time::timeout(self.timeout, write_bank(ctx, bank, offset, value)).await;
        self.settle(&mut slot, result)
    }

    async fn probe(&self) -> LinkState {
        // Any answer, including a Modbus exception, proves the device is there.
        match self.read(RegisterBank::Holding, 0, 1).await {
            Ok(_) | Err(IoError::Exception(_)) => LinkState::Online,
            Err(e) => {
                debug!("Probe of {} failed: {}", self.link, e);
                LinkState::Offline
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(mut ctx) = self.context.lock().await.take() {
            if let Err(e) = ctx.disconnect().await {
                debug!("Disconnect from {} failed: {}", self.link, e);
            }
        }
    }
}

/// Open a connection context for a link.
async fn connect_link(
    link: &Link,
    slave: Slave,
    timeout: Duration,
) -> Result<Context, ConnectionError> {
    match link {
        Link::Tcp { host, port } => {
            let connect = async {
                let address = format!("{}:{}", host, port);
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| ConnectionError::Address {
                        address: address.clone(),
                        reason: e.to_string(),
                    })?
                    .next()
                    .ok_or_else(|| ConnectionError::Address {
                        address,
                        reason: "no address resolved".to_string(),
                    })?;

                tcp::connect_slave(addr, slave)
                    .await
                    .map_err(|e| ConnectionError::Connect(e.to_string()))
            };

            tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| ConnectionError::Timeout(timeout))?
        }
        Link::Rtu(serial) => open_serial(serial, slave, timeout),
    }
}

fn open_serial(
    serial: &SerialSettings,
    slave: Slave,
    timeout: Duration,
) -> Result<Context, ConnectionError> {
    let parity = match serial.parity.to_lowercase().as_str() {
        "even" | "e" => tokio_serial::Parity::Even,
        "odd" | "o" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    };

    let stop_bits = match serial.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    let data_bits = match serial.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };

    if serial.rs485 {
        // Direction control is left to the adapter or kernel driver.
        info!("Serial port {} is configured as RS485", serial.port);
    }

    let builder = tokio_serial::new(&serial.port, serial.baud_rate)
        .parity(parity)
        .stop_bits(stop_bits)
        .data_bits(data_bits)
        .timeout(timeout);

    let stream = tokio_serial::SerialStream::open(&builder)
        .map_err(|e| ConnectionError::Serial(format!("{}: {}", serial.port, e)))?;

    Ok(rtu::attach_slave(stream, slave))
}

async fn read_bank(
    ctx: &mut Context,
    bank: RegisterBank,
    offset: u16,
    quantity: u16,
) -> Result<Vec<u16>, IoError> {
    let words = match bank {
        RegisterBank::Coil => ctx
            .read_coils(offset, quantity)
            .await
            .map_err(|e| IoError::Transport(e.to_string()))?
            .map_err(|e| IoError::Exception(format!("{:?}", e)))?
            .into_iter()
            .map(u16::from)
            .collect(),
        RegisterBank::DiscreteInput => ctx
            .read_discrete_inputs(offset, quantity)
            .await
            .map_err(|e| IoError::Transport(e.to_string()))?
            .map_err(|e| IoError::Exception(format!("{:?}", e)))?
            .into_iter()
            .map(u16::from)
            .collect(),
        RegisterBank::Holding => ctx
            .read_holding_registers(offset, quantity)
            .await
            .map_err(|e| IoError::Transport(e.to_string()))?
            .map_err(|e| IoError::Exception(format!("{:?}", e)))?,
        RegisterBank::Input => ctx
            .read_input_registers(offset, quantity)
            .await
            .map_err(|e| IoError::Transport(e.to_string()))?
            .map_err(|e| IoError::Exception(format!("{:?}", e)))?,
    };

    Ok(words)
}

async fn write_bank(
    ctx: &mut Context,
    bank: RegisterBank,
    offset: u16,
    value: u16,
) -> Result<(), IoError> {
    match bank {
        RegisterBank::Holding => ctx
            .write_single_register(offset, value)
            .await
            .map_err(|e| IoError::Transport(e.to_string()))?
            .map_err(|e| IoError::Exception(format!("{:?}", e))),
        RegisterBank::Coil => ctx
            .write_single_coil(offset, value != 0)
            .await
            .map_err(|e| IoError::Transport(e.to_string()))?
            .map_err(|e| IoError::Exception(format!("{:?}", e))),
        RegisterBank::DiscreteInput | RegisterBank::Input => Err(IoError::NotWritable(bank)),
    }
}
