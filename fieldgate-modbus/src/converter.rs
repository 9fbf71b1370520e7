//! Uplink/downlink conversion strategies.
//!
//! Uplink converters turn raw register values into platform-ready
//! telemetry and attributes; downlink converters turn inbound command
//! parameters into write payloads. Strategies are looked up by name in
//! a registry once at startup; the built-in byte converters are the
//! default for both directions.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use fieldgate_common::data::{DataValue, DeviceData};

use crate::config::{ByteOrder, DataType, FunctionCode, ItemConfig};
use crate::dispatcher::{RegisterValues, WritePayload};

/// Errors from conversion strategies.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Unknown converter: {0}")]
    UnknownConverter(String),
}

/// One polled item paired with its raw operation result.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub item: ItemConfig,
    pub values: RegisterValues,
}

/// All raw results gathered for one device in one poll tick.
#[derive(Debug, Clone)]
pub struct PollBatch {
    pub device_name: String,
    pub device_type: String,
    pub telemetry: Vec<BatchEntry>,
    pub attributes: Vec<BatchEntry>,
}

impl PollBatch {
    pub fn new(device_name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            device_type: device_type.into(),
            telemetry: Vec::new(),
            attributes: Vec::new(),
        }
    }
}

/// Strategy converting raw device data into platform-ready values.
pub trait UplinkConverter: Send + Sync {
    /// Convert a full poll batch into telemetry/attribute pairs.
    fn convert_batch(
        &self,
        byte_order: ByteOrder,
        batch: &PollBatch,
    ) -> Result<DeviceData, ConversionError>;

    /// Convert the read-back of an RPC command into a reply payload,
    /// keyed by the method name.
    fn convert_rpc(
        &self,
        byte_order: ByteOrder,
        method: &str,
        item: &ItemConfig,
        values: &RegisterValues,
    ) -> Result<serde_json::Value, ConversionError>;
}

/// Strategy converting inbound command parameters into write payloads.
pub trait DownlinkConverter: Send + Sync {
    fn convert(
        &self,
        item: &ItemConfig,
        byte_order: ByteOrder,
        params: &serde_json::Value,
    ) -> Result<WritePayload, ConversionError>;
}

/// Decode a run of 16-bit registers according to a data type and word
/// order. A single decoded value is returned bare; several become an
/// array.
pub fn decode_words(
    words: &[u16],
    data_type: DataType,
    byte_order: ByteOrder,
) -> Result<DataValue, ConversionError> {
    let per = data_type.words_per_value() as usize;
    if words.len() < per {
        return Err(ConversionError::InvalidData(format!(
            "short read: got {} registers, need {}",
            words.len(),
            per
        )));
    }

    let mut values = Vec::new();
    for chunk in words.chunks_exact(per) {
        let ordered: Vec<u16> = match byte_order {
            ByteOrder::Big => chunk.to_vec(),
            ByteOrder::Little => chunk.iter().rev().copied().collect(),
        };

        let value = match data_type {
            DataType::Bool => DataValue::Boolean(ordered[0] != 0),
            DataType::U16 => DataValue::Integer(ordered[0] as i64),
            DataType::I16 => DataValue::Integer(ordered[0] as i16 as i64),
            DataType::U32 => {
                DataValue::Integer((((ordered[0] as u32) << 16) | ordered[1] as u32) as i64)
            }
            DataType::I32 => {
                DataValue::Integer((((ordered[0] as u32) << 16) | ordered[1] as u32) as i32 as i64)
            }
            DataType::F32 => {
                let bits = ((ordered[0] as u32) << 16) | ordered[1] as u32;
                DataValue::Float(f32::from_bits(bits) as f64)
            }
            DataType::F64 => {
                let bits = ((ordered[0] as u64) << 48)
                    | ((ordered[1] as u64) << 32)
                    | ((ordered[2] as u64) << 16)
                    | ordered[3] as u64;
                DataValue::Float(f64::from_bits(bits))
            }
        };
        values.push(value);
    }

    if values.len() == 1 {
        Ok(values.remove(0))
    } else {
        Ok(DataValue::Array(values))
    }
}

/// Decode coil/discrete-input bits.
pub fn decode_bits(bits: &[bool]) -> Result<DataValue, ConversionError> {
    match bits {
        [] => Err(ConversionError::InvalidData("empty bit read".to_string())),
        [single] => Ok(DataValue::Boolean(*single)),
        many => Ok(DataValue::Array(
            many.iter().map(|b| DataValue::Boolean(*b)).collect(),
        )),
    }
}

fn decode_entry(
    entry: &BatchEntry,
    byte_order: ByteOrder,
) -> Result<DataValue, ConversionError> {
    match &entry.values {
        RegisterValues::Bits(bits) => decode_bits(bits),
        RegisterValues::Words(words) => decode_words(words, entry.item.data_type, byte_order),
        RegisterValues::WriteAck => Err(ConversionError::InvalidData(format!(
            "write acknowledgement for polled item '{}'",
            entry.item.tag
        ))),
    }
}

/// Default uplink strategy decoding raw register bytes.
#[derive(Debug, Default)]
pub struct BytesUplinkConverter;

impl UplinkConverter for BytesUplinkConverter {
    fn convert_batch(
        &self,
        byte_order: ByteOrder,
        batch: &PollBatch,
    ) -> Result<DeviceData, ConversionError> {
        let mut data = DeviceData::new(&batch.device_name, &batch.device_type);

        for entry in &batch.telemetry {
            let value = decode_entry(entry, byte_order)?;
            data.push_telemetry(&entry.item.tag, value);
        }
        for entry in &batch.attributes {
            let value = decode_entry(entry, byte_order)?;
            data.push_attribute(&entry.item.tag, value);
        }

        Ok(data)
    }

    fn convert_rpc(
        &self,
        byte_order: ByteOrder,
        method: &str,
        item: &ItemConfig,
        values: &RegisterValues,
    ) -> Result<serde_json::Value, ConversionError> {
        let value = match values {
            RegisterValues::Bits(bits) => decode_bits(bits)?,
            RegisterValues::Words(words) => decode_words(words, item.data_type, byte_order)?,
            RegisterValues::WriteAck => {
                return Err(ConversionError::InvalidData(
                    "write acknowledgement has no value".to_string(),
                ));
            }
        };

        let value = serde_json::to_value(&value)
            .map_err(|e| ConversionError::InvalidData(e.to_string()))?;
        let mut reply = serde_json::Map::new();
        reply.insert(method.to_string(), value);
        Ok(serde_json::Value::Object(reply))
    }
}

fn params_as_bool(params: &serde_json::Value) -> Result<bool, ConversionError> {
    match params {
        serde_json::Value::Bool(b) => Ok(*b),
        serde_json::Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        other => Err(ConversionError::InvalidData(format!(
            "expected a boolean, got {}",
            other
        ))),
    }
}

/// Encode one scalar parameter into registers for the given data type.
pub fn encode_words(
    params: &serde_json::Value,
    data_type: DataType,
    byte_order: ByteOrder,
) -> Result<Vec<u16>, ConversionError> {
    let words: Vec<u16> = match data_type {
        DataType::Bool => vec![params_as_bool(params)? as u16],
        DataType::U16 | DataType::I16 => {
            let n = params.as_i64().ok_or_else(|| {
                ConversionError::InvalidData(format!("expected an integer, got {}", params))
            })?;
            vec![n as u16]
        }
        DataType::U32 | DataType::I32 => {
            let n = params.as_i64().ok_or_else(|| {
                ConversionError::InvalidData(format!("expected an integer, got {}", params))
            })? as u32;
            vec![(n >> 16) as u16, n as u16]
        }
        DataType::F32 => {
            let n = params.as_f64().ok_or_else(|| {
                ConversionError::InvalidData(format!("expected a number, got {}", params))
            })?;
            let bits = (n as f32).to_bits();
            vec![(bits >> 16) as u16, bits as u16]
        }
        DataType::F64 => {
            let n = params.as_f64().ok_or_else(|| {
                ConversionError::InvalidData(format!("expected a number, got {}", params))
            })?;
            let bits = n.to_bits();
            vec![
                (bits >> 48) as u16,
                (bits >> 32) as u16,
                (bits >> 16) as u16,
                bits as u16,
            ]
        }
    };

    Ok(match byte_order {
        ByteOrder::Big => words,
        ByteOrder::Little => words.into_iter().rev().collect(),
    })
}

/// Default downlink strategy encoding parameters into register bytes.
#[derive(Debug, Default)]
pub struct BytesDownlinkConverter;

impl DownlinkConverter for BytesDownlinkConverter {
    fn convert(
        &self,
        item: &ItemConfig,
        byte_order: ByteOrder,
        params: &serde_json::Value,
    ) -> Result<WritePayload, ConversionError> {
        match item.function_code {
            FunctionCode::WriteSingleCoil => Ok(WritePayload::Coil(params_as_bool(params)?)),
            FunctionCode::WriteMultipleCoils => match params {
                serde_json::Value::Array(items) => {
                    let bits = items
                        .iter()
                        .map(params_as_bool)
                        .collect::<Result<Vec<bool>, _>>()?;
                    Ok(WritePayload::Coils(bits))
                }
                single => Ok(WritePayload::Coils(vec![params_as_bool(single)?])),
            },
            FunctionCode::WriteSingleRegister => {
                let words = encode_words(params, item.data_type, byte_order)?;
                match words.as_slice() {
                    [word] => Ok(WritePayload::Register(*word)),
                    _ => Err(ConversionError::InvalidData(format!(
                        "data type {:?} does not fit a single register",
                        item.data_type
                    ))),
                }
            }
            FunctionCode::WriteMultipleRegisters => match params {
                serde_json::Value::Array(items) => {
                    let mut words = Vec::new();
                    for value in items {
                        words.extend(encode_words(value, item.data_type, byte_order)?);
                    }
                    Ok(WritePayload::Registers(words))
                }
                single => Ok(WritePayload::Registers(encode_words(
                    single,
                    item.data_type,
                    byte_order,
                )?)),
            },
            code => Err(ConversionError::InvalidData(format!(
                "function {:?} is not a write operation",
                code
            ))),
        }
    }
}

/// Lookup-by-name registry for conversion strategies.
///
/// Populated at configuration time and resolved once at startup; the
/// built-in byte converters are registered under "bytes" and used when
/// a device names no custom strategy.
pub struct ConverterRegistry {
    uplink: HashMap<String, Arc<dyn UplinkConverter>>,
    downlink: HashMap<String, Arc<dyn DownlinkConverter>>,
}

const DEFAULT_CONVERTER: &str = "bytes";

impl Default for ConverterRegistry {
    fn default() -> Self {
        let mut registry = Self {
            uplink: HashMap::new(),
            downlink: HashMap::new(),
        };
        registry.register_uplink(DEFAULT_CONVERTER, Arc::new(BytesUplinkConverter));
        registry.register_downlink(DEFAULT_CONVERTER, Arc::new(BytesDownlinkConverter));
        registry
    }
}

impl ConverterRegistry {
    /// Register an uplink strategy under a name.
    pub fn register_uplink(&mut self, name: impl Into<String>, conv: Arc<dyn UplinkConverter>) {
        self.uplink.insert(name.into(), conv);
    }

    /// Register a downlink strategy under a name.
    pub fn register_downlink(&mut self, name: impl Into<String>, conv: Arc<dyn DownlinkConverter>) {
        self.downlink.insert(name.into(), conv);
    }

    /// Resolve an uplink strategy; `None` selects the default.
    pub fn resolve_uplink(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn UplinkConverter>, ConversionError> {
        let name = name.unwrap_or(DEFAULT_CONVERTER);
        self.uplink
            .get(name)
            .cloned()
            .ok_or_else(|| ConversionError::UnknownConverter(name.to_string()))
    }

    /// Resolve a downlink strategy; `None` selects the default.
    pub fn resolve_downlink(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn DownlinkConverter>, ConversionError> {
        let name = name.unwrap_or(DEFAULT_CONVERTER);
        self.downlink
            .get(name)
            .cloned()
            .ok_or_else(|| ConversionError::UnknownConverter(name.to_string()))
    }
}
