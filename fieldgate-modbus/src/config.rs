//! Configuration for the Modbus connector.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use fieldgate_common::config::{LoggingConfig, ZenohConfig};
use fieldgate_common::serialization::Format;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConnectorConfig {
    /// Zenoh connection settings
    pub zenoh: ZenohConfig,

    /// Modbus-specific settings
    pub modbus: ModbusConfig,

    /// Payload serialization format: "json" (default) or "cbor"
    #[serde(default)]
    pub serialization: Format,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Modbus connector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Connector name, used in log lines and forwarded data
    #[serde(default = "default_connector_name")]
    pub name: String,

    /// Key expression prefix (default: "fieldgate/modbus")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Transport kind and address
    pub transport: TransportConfig,

    /// Register word order for multi-register values
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Transport operation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Interval between connect retries in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Devices to poll
    pub devices: Vec<DeviceConfig>,
}

fn default_connector_name() -> String {
    "modbus".to_string()
}

fn default_key_prefix() -> String {
    "fieldgate/modbus".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retry_interval_ms() -> u64 {
    5000
}

/// Transport configuration (TCP or serial RTU).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU over a serial line
    Serial {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

/// Word order for values spanning multiple 16-bit registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ByteOrder {
    /// First register holds the most significant word (default).
    #[default]
    Big,
    /// First register holds the least significant word.
    Little,
}

/// Configuration for a single polled device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name (unique across the connector)
    pub name: String,

    /// Device type/profile reported to the platform
    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Forward only tags whose value changed since the last forward
    #[serde(default)]
    pub send_data_only_on_change: bool,

    /// Telemetry items
    #[serde(default)]
    pub telemetry: Vec<ItemConfig>,

    /// Telemetry poll period in milliseconds
    #[serde(default = "default_poll_period_ms")]
    pub telemetry_poll_period_ms: u64,

    /// Attribute items
    #[serde(default)]
    pub attributes: Vec<ItemConfig>,

    /// Attribute poll period in milliseconds
    #[serde(default = "default_poll_period_ms")]
    pub attributes_poll_period_ms: u64,

    /// Commands executed when the platform updates a shared attribute
    #[serde(default)]
    pub attribute_updates: Vec<ItemConfig>,

    /// RPC command table (map keyed by method, or list scanned by tag)
    #[serde(default)]
    pub rpc: RpcTable,

    /// Custom uplink converter name (default byte converter otherwise)
    #[serde(default)]
    pub converter: Option<String>,

    /// Custom downlink converter name (default byte converter otherwise)
    #[serde(default)]
    pub downlink_converter: Option<String>,
}

fn default_device_type() -> String {
    "default".to_string()
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_period_ms() -> u64 {
    5000
}

/// RPC command table shape.
///
/// Both forms appear in the wild: a mapping from method name to command,
/// or an ordered list of commands each carrying its own tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcTable {
    /// Mapping from method name to command descriptor.
    Map(HashMap<String, ItemConfig>),
    /// Ordered list of command descriptors, matched by tag.
    List(Vec<ItemConfig>),
}

impl Default for RpcTable {
    fn default() -> Self {
        RpcTable::List(Vec::new())
    }
}

impl RpcTable {
    /// Resolve a command descriptor for a method name.
    ///
    /// Map tables are looked up directly; list tables are scanned for
    /// the first descriptor whose tag equals the method.
    pub fn resolve(&self, method: &str) -> Option<&ItemConfig> {
        match self {
            RpcTable::Map(map) => map.get(method),
            RpcTable::List(list) => list.iter().find(|cmd| cmd.tag == method),
        }
    }
}

/// Descriptor for a register item.
///
/// Used for telemetry and attribute polling as well as RPC and
/// attribute-update commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemConfig {
    /// Logical tag (empty for map-shaped RPC entries, where the
    /// method name is the map key)
    #[serde(default)]
    pub tag: String,

    /// Modbus function code
    pub function_code: FunctionCode,

    /// Starting register address (0-based)
    pub address: u16,

    /// Number of coils/registers addressed (default: 1)
    #[serde(default = "default_count")]
    pub count: u16,

    /// Data type interpretation for register values
    #[serde(default)]
    pub data_type: DataType,
}

fn default_count() -> u16 {
    1
}

/// The closed set of supported Modbus functions.
///
/// Deserialized from the numeric function code, so an unknown code is
/// rejected while loading the configuration and can never reach the
/// transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl FunctionCode {
    /// True for the read group (coils, discrete inputs, registers).
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// True for the write group.
    pub fn is_write(&self) -> bool {
        !self.is_read()
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(FunctionCode::ReadCoils),
            2 => Ok(FunctionCode::ReadDiscreteInputs),
            3 => Ok(FunctionCode::ReadHoldingRegisters),
            4 => Ok(FunctionCode::ReadInputRegisters),
            5 => Ok(FunctionCode::WriteSingleCoil),
            6 => Ok(FunctionCode::WriteSingleRegister),
            15 => Ok(FunctionCode::WriteMultipleCoils),
            16 => Ok(FunctionCode::WriteMultipleRegisters),
            other => Err(format!("unknown Modbus function code: {}", other)),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> u8 {
        match code {
            FunctionCode::ReadCoils => 1,
            FunctionCode::ReadDiscreteInputs => 2,
            FunctionCode::ReadHoldingRegisters => 3,
            FunctionCode::ReadInputRegisters => 4,
            FunctionCode::WriteSingleCoil => 5,
            FunctionCode::WriteSingleRegister => 6,
            FunctionCode::WriteMultipleCoils => 15,
            FunctionCode::WriteMultipleRegisters => 16,
        }
    }
}

/// Data type interpretation for register values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Boolean (coils and discrete inputs, or a non-zero register)
    Bool,
    /// Unsigned 16-bit integer (default)
    #[default]
    U16,
    /// Signed 16-bit integer
    I16,
    /// Unsigned 32-bit integer (2 registers)
    U32,
    /// Signed 32-bit integer (2 registers)
    I32,
    /// 32-bit float (2 registers)
    F32,
    /// 64-bit float (4 registers)
    F64,
}

impl DataType {
    /// Number of 16-bit registers one value of this type occupies.
    pub fn words_per_value(&self) -> u16 {
        match self {
            DataType::Bool | DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 | DataType::F32 => 2,
            DataType::F64 => 4,
        }
    }
}

impl ModbusConnectorConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ModbusConnectorConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modbus.devices.is_empty() {
            return Err(ConfigError::Validation(
                "At least one device must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.modbus.devices {
            if device.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Device name cannot be empty".to_string(),
                ));
            }

            if !seen.insert(device.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device name '{}'",
                    device.name
                )));
            }

            if device.unit_id == 0 {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': unit_id must be 1-247",
                    device.name
                )));
            }

            for (group, items) in [
                ("telemetry", &device.telemetry),
                ("attributes", &device.attributes),
            ] {
                for item in items {
                    if item.tag.is_empty() {
                        return Err(ConfigError::Validation(format!(
                            "Device '{}': {} item at address {} has no tag",
                            device.name, group, item.address
                        )));
                    }
                    if !item.function_code.is_read() {
                        return Err(ConfigError::Validation(format!(
                            "Device '{}': {} item '{}' must use a read function code",
                            device.name, group, item.tag
                        )));
                    }
                    if item.count == 0 {
                        return Err(ConfigError::Validation(format!(
                            "Device '{}': {} item '{}' has count 0",
                            device.name, group, item.tag
                        )));
                    }
                }
            }

            for cmd in &device.attribute_updates {
                if cmd.tag.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Device '{}': attribute update command without a tag",
                        device.name
                    )));
                }
            }

            if let RpcTable::List(commands) = &device.rpc {
                for cmd in commands {
                    if cmd.tag.is_empty() {
                        return Err(ConfigError::Validation(format!(
                            "Device '{}': rpc list entry without a tag",
                            device.name
                        )));
                    }
                }
            }
        }

        if let TransportConfig::Serial { parity, stop_bits, .. } = &self.modbus.transport {
            match parity.to_lowercase().as_str() {
                "none" | "even" | "odd" => {}
                other => {
                    return Err(ConfigError::Validation(format!(
                        "Invalid parity '{}' (use none, even, or odd)",
                        other
                    )));
                }
            }
            if !matches!(stop_bits, 1 | 2) {
                return Err(ConfigError::Validation(format!(
                    "Invalid stop_bits {} (use 1 or 2)",
                    stop_bits
                )));
            }
        }

        Ok(())
    }
}
