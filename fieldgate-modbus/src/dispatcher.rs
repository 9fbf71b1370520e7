//! Register operation dispatch.
//!
//! Maps a [`FunctionCode`] plus parameters onto the transport session's
//! primitives and classifies the outcome. The function-code match is
//! exhaustive, so no unknown operation can reach the transport layer.

use thiserror::Error;

use crate::config::FunctionCode;
use crate::transport::{ModbusTransport, TransportError};

/// Raw result of a register operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValues {
    /// Result of a coil/discrete-input read.
    Bits(Vec<bool>),
    /// Result of a holding/input-register read.
    Words(Vec<u16>),
    /// Acknowledged write.
    WriteAck,
}

/// Payload for the write group of operations.
#[derive(Debug, Clone, PartialEq)]
pub enum WritePayload {
    Coil(bool),
    Coils(Vec<bool>),
    Register(u16),
    Registers(Vec<u16>),
}

/// Parameters for one dispatched operation: an element count for the
/// read group, or a payload for the write group.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationInput {
    Count(u16),
    Payload(WritePayload),
}

/// Dispatch errors, partitioned by the recovery they demand.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Transport-level failure; the caller must reconnect.
    #[error("Connection error: {0}")]
    Connection(String),
    /// Device-reported exception; log and move on.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Operation/parameter mismatch from configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<TransportError> for DispatchError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Connection(msg) => DispatchError::Connection(msg),
            TransportError::NotConnected => DispatchError::Connection(e.to_string()),
            TransportError::Protocol(msg) => DispatchError::Protocol(msg),
        }
    }
}

impl DispatchError {
    /// True when the scheduler must pause and reconnect.
    pub fn is_connection(&self) -> bool {
        matches!(self, DispatchError::Connection(_))
    }
}

/// Execute one register operation against the transport session.
pub async fn execute(
    transport: &mut dyn ModbusTransport,
    code: FunctionCode,
    unit: u8,
    address: u16,
    input: OperationInput,
) -> Result<RegisterValues, DispatchError> {
    match (code, input) {
        (FunctionCode::ReadCoils, OperationInput::Count(count)) => {
            let bits = transport.read_coils(unit, address, count).await?;
            Ok(RegisterValues::Bits(bits))
        }
        (FunctionCode::ReadDiscreteInputs, OperationInput::Count(count)) => {
            let bits = transport.read_discrete_inputs(unit, address, count).await?;
            Ok(RegisterValues::Bits(bits))
        }
        (FunctionCode::ReadHoldingRegisters, OperationInput::Count(count)) => {
            let words = transport.read_holding_registers(unit, address, count).await?;
            Ok(RegisterValues::Words(words))
        }
        (FunctionCode::ReadInputRegisters, OperationInput::Count(count)) => {
            let words = transport.read_input_registers(unit, address, count).await?;
            Ok(RegisterValues::Words(words))
        }
        (FunctionCode::WriteSingleCoil, OperationInput::Payload(WritePayload::Coil(value))) => {
            transport.write_single_coil(unit, address, value).await?;
            Ok(RegisterValues::WriteAck)
        }
        (
            FunctionCode::WriteSingleRegister,
            OperationInput::Payload(WritePayload::Register(value)),
        ) => {
            transport.write_single_register(unit, address, value).await?;
            Ok(RegisterValues::WriteAck)
        }
        (
            FunctionCode::WriteMultipleCoils,
            OperationInput::Payload(WritePayload::Coils(values)),
        ) => {
            transport.write_multiple_coils(unit, address, &values).await?;
            Ok(RegisterValues::WriteAck)
        }
        (
            FunctionCode::WriteMultipleRegisters,
            OperationInput::Payload(WritePayload::Registers(values)),
        ) => {
            transport
                .write_multiple_registers(unit, address, &values)
                .await?;
            Ok(RegisterValues::WriteAck)
        }
        (code, input) => Err(DispatchError::Config(format!(
            "Function {:?} cannot take {:?}",
            code, input
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Transport stub returning fixed values.
    struct FixedTransport {
        words: Vec<u16>,
        bits: Vec<bool>,
        fail_connection: bool,
        writes: Vec<(u8, u16, WritePayload)>,
    }

    impl FixedTransport {
        fn new() -> Self {
            Self {
                words: vec![21],
                bits: vec![true],
                fail_connection: false,
                writes: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl ModbusTransport for FixedTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) {}

        fn is_connected(&self) -> bool {
            true
        }

        async fn read_coils(
            &mut self,
            _unit: u8,
            _address: u16,
            _count: u16,
        ) -> Result<Vec<bool>, TransportError> {
            if self.fail_connection {
                return Err(TransportError::Connection("lost".into()));
            }
            Ok(self.bits.clone())
        }

        async fn read_discrete_inputs(
            &mut self,
            _unit: u8,
            _address: u16,
            _count: u16,
        ) -> Result<Vec<bool>, TransportError> {
            Ok(self.bits.clone())
        }

        async fn read_holding_registers(
            &mut self,
            _unit: u8,
            _address: u16,
            _count: u16,
        ) -> Result<Vec<u16>, TransportError> {
            Err(TransportError::Protocol("Exception: IllegalDataAddress".into()))
        }

        async fn read_input_registers(
            &mut self,
            _unit: u8,
            _address: u16,
            _count: u16,
        ) -> Result<Vec<u16>, TransportError> {
            Ok(self.words.clone())
        }

        async fn write_single_coil(
            &mut self,
            unit: u8,
            address: u16,
            value: bool,
        ) -> Result<(), TransportError> {
            self.writes.push((unit, address, WritePayload::Coil(value)));
            Ok(())
        }

        async fn write_single_register(
            &mut self,
            unit: u8,
            address: u16,
            value: u16,
        ) -> Result<(), TransportError> {
            self.writes
                .push((unit, address, WritePayload::Register(value)));
            Ok(())
        }

        async fn write_multiple_coils(
            &mut self,
            unit: u8,
            address: u16,
            values: &[bool],
        ) -> Result<(), TransportError> {
            self.writes
                .push((unit, address, WritePayload::Coils(values.to_vec())));
            Ok(())
        }

        async fn write_multiple_registers(
            &mut self,
            unit: u8,
            address: u16,
            values: &[u16],
        ) -> Result<(), TransportError> {
            self.writes
                .push((unit, address, WritePayload::Registers(values.to_vec())));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_read_dispatch() {
        let mut transport = FixedTransport::new();

        let result = execute(
            &mut transport,
            FunctionCode::ReadInputRegisters,
            1,
            0,
            OperationInput::Count(1),
        )
        .await
        .unwrap();
        assert_eq!(result, RegisterValues::Words(vec![21]));

        let result = execute(
            &mut transport,
            FunctionCode::ReadCoils,
            1,
            0,
            OperationInput::Count(1),
        )
        .await
        .unwrap();
        assert_eq!(result, RegisterValues::Bits(vec![true]));
    }

    #[tokio::test]
    async fn test_write_dispatch() {
        let mut transport = FixedTransport::new();

        let result = execute(
            &mut transport,
            FunctionCode::WriteSingleRegister,
            3,
            10,
            OperationInput::Payload(WritePayload::Register(42)),
        )
        .await
        .unwrap();
        assert_eq!(result, RegisterValues::WriteAck);
        assert_eq!(transport.writes, vec![(3, 10, WritePayload::Register(42))]);
    }

    #[tokio::test]
    async fn test_protocol_error_classified() {
        let mut transport = FixedTransport::new();

        let err = execute(
            &mut transport,
            FunctionCode::ReadHoldingRegisters,
            1,
            0,
            OperationInput::Count(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
        assert!(!err.is_connection());
    }

    #[tokio::test]
    async fn test_connection_error_classified() {
        let mut transport = FixedTransport::new();
        transport.fail_connection = true;

        let err = execute(
            &mut transport,
            FunctionCode::ReadCoils,
            1,
            0,
            OperationInput::Count(1),
        )
        .await
        .unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_mismatched_input_is_config_error() {
        let mut transport = FixedTransport::new();

        let err = execute(
            &mut transport,
            FunctionCode::ReadCoils,
            1,
            0,
            OperationInput::Payload(WritePayload::Coil(true)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }
}
