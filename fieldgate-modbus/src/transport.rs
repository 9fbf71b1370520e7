//! Transport session for the Modbus connector.
//!
//! Owns the single physical/network connection to the device fleet and
//! exposes the read/write primitives the dispatcher builds on. At most
//! one operation is in flight at a time; the connector serializes all
//! callers behind one lock.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::prelude::*;

use crate::config::TransportConfig;

/// Error type for transport operations.
///
/// Connection-level failures are kept apart from device-reported
/// exceptions so callers can reconnect on the former and merely log
/// the latter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Device exception: {0}")]
    Protocol(String),
    #[error("Transport is not connected")]
    NotConnected,
}

impl TransportError {
    /// True when the error means the transport itself is unusable.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::NotConnected
        )
    }
}

/// The fixed set of primitives a Modbus transport offers.
///
/// Implemented by [`ModbusClient`] for real devices and by scripted
/// mocks in tests. Every primitive takes the unit/slave id of the
/// addressed device; the transport line is shared across units.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Establish the connection. Replaces any previous session.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Release the connection.
    async fn close(&mut self);

    /// Whether a session is currently established.
    fn is_connected(&self) -> bool;

    async fn read_coils(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_discrete_inputs(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn read_input_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_single_coil(
        &mut self,
        unit: u8,
        address: u16,
        value: bool,
    ) -> Result<(), TransportError>;

    async fn write_single_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError>;

    async fn write_multiple_coils(
        &mut self,
        unit: u8,
        address: u16,
        values: &[bool],
    ) -> Result<(), TransportError>;

    async fn write_multiple_registers(
        &mut self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError>;
}

fn connection_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Connection(e.to_string())
}

fn exception_err(e: impl std::fmt::Debug) -> TransportError {
    TransportError::Protocol(format!("Exception: {:?}", e))
}

/// Production transport over tokio-modbus (TCP or RTU serial).
pub struct ModbusClient {
    config: TransportConfig,
    timeout: Duration,
    ctx: Option<Context>,
}

impl ModbusClient {
    /// Create a disconnected client.
    pub fn new(config: TransportConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            ctx: None,
        }
    }

    // Associated fn, not a method: `Context` is not `Sync`, so a
    // future capturing `&self` would not be `Send`.
    async fn open_context(
        config: &TransportConfig,
        timeout: Duration,
    ) -> Result<Context, TransportError> {
        match config {
            TransportConfig::Tcp { host, port } => {
                let addr: SocketAddr = format!("{}:{}", host, port)
                    .parse()
                    .map_err(|e| TransportError::Connection(format!("Invalid address: {}", e)))?;

                let ctx = tokio::time::timeout(timeout, tcp::connect(addr))
                    .await
                    .map_err(|_| TransportError::Connection("Connection timeout".to_string()))?
                    .map_err(connection_err)?;

                Ok(ctx)
            }
            TransportConfig::Serial {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity.to_lowercase().as_str() {
                    "even" => tokio_serial::Parity::Even,
                    "odd" => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };

                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(port, *baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits);

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    TransportError::Connection(format!("Serial open failed: {}", e))
                })?;

                Ok(rtu::attach(serial))
            }
        }
    }

    fn context(&mut self, unit: u8) -> Result<&mut Context, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(unit));
        Ok(ctx)
    }
}

#[async_trait]
impl ModbusTransport for ModbusClient {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.ctx = None;
        let ctx = Self::open_context(&self.config, self.timeout).await?;
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.disconnect().await {
                tracing::debug!(error = %e, "Error while closing Modbus session");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_coils(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let timeout = self.timeout;
        let ctx = self.context(unit)?;
        tokio::time::timeout(timeout, ctx.read_coils(address, count))
            .await
            .map_err(|_| TransportError::Connection("Operation timeout".to_string()))?
            .map_err(connection_err)?
            .map_err(exception_err)
    }

    async fn read_discrete_inputs(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let timeout = self.timeout;
        let ctx = self.context(unit)?;
        tokio::time::timeout(timeout, ctx.read_discrete_inputs(address, count))
            .await
            .map_err(|_| TransportError::Connection("Operation timeout".to_string()))?
            .map_err(connection_err)?
            .map_err(exception_err)
    }

    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let timeout = self.timeout;
        let ctx = self.context(unit)?;
        tokio::time::timeout(timeout, ctx.read_holding_registers(address, count))
            .await
            .map_err(|_| TransportError::Connection("Operation timeout".to_string()))?
            .map_err(connection_err)?
            .map_err(exception_err)
    }

    async fn read_input_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let timeout = self.timeout;
        let ctx = self.context(unit)?;
        tokio::time::timeout(timeout, ctx.read_input_registers(address, count))
            .await
            .map_err(|_| TransportError::Connection("Operation timeout".to_string()))?
            .map_err(connection_err)?
            .map_err(exception_err)
    }

    async fn write_single_coil(
        &mut self,
        unit: u8,
        address: u16,
        value: bool,
    ) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let ctx = self.context(unit)?;
        tokio::time::timeout(timeout, ctx.write_single_coil(address, value))
            .await
            .map_err(|_| TransportError::Connection("Operation timeout".to_string()))?
            .map_err(connection_err)?
            .map_err(exception_err)
    }

    async fn write_single_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let ctx = self.context(unit)?;
        tokio::time::timeout(timeout, ctx.write_single_register(address, value))
            .await
            .map_err(|_| TransportError::Connection("Operation timeout".to_string()))?
            .map_err(connection_err)?
            .map_err(exception_err)
    }

    async fn write_multiple_coils(
        &mut self,
        unit: u8,
        address: u16,
        values: &[bool],
    ) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let ctx = self.context(unit)?;
        tokio::time::timeout(timeout, ctx.write_multiple_coils(address, values))
            .await
            .map_err(|_| TransportError::Connection("Operation timeout".to_string()))?
            .map_err(connection_err)?
            .map_err(exception_err)
    }

    async fn write_multiple_registers(
        &mut self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let ctx = self.context(unit)?;
        tokio::time::timeout(timeout, ctx.write_multiple_registers(address, values))
            .await
            .map_err(|_| TransportError::Connection("Operation timeout".to_string()))?
            .map_err(connection_err)?
            .map_err(exception_err)
    }
}
