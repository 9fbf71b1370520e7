use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Typed value produced by a device conversion strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DataValue {
    /// Boolean value (coils, discrete inputs).
    Boolean(bool),

    /// Integer value.
    Integer(i64),

    /// Floating point value.
    Float(f64),

    /// Text value.
    Text(String),

    /// Array of values (multi-element register reads).
    Array(Vec<DataValue>),
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        DataValue::Boolean(v)
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Integer(v)
    }
}

impl From<u16> for DataValue {
    fn from(v: u16) -> Self {
        DataValue::Integer(v as i64)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Float(v)
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::Text(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Text(v.to_string())
    }
}

/// A single converted key/value pair.
///
/// On the wire the platform expects each pair as its own single-entry
/// map, so `DataEntry { key: "temp", value: 21 }` serializes as
/// `{"temp": 21}`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEntry {
    /// Logical tag of the item.
    pub key: String,
    /// Converted value.
    pub value: DataValue,
}

impl DataEntry {
    /// Create a new entry.
    pub fn new(key: impl Into<String>, value: impl Into<DataValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Serialize for DataEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.key, &self.value)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for DataEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = DataEntry;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a single-entry map of tag to value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let (key, value): (String, DataValue) = access
                    .next_entry()?
                    .ok_or_else(|| serde::de::Error::custom("expected one tag/value entry"))?;

                if access.next_entry::<String, DataValue>()?.is_some() {
                    return Err(serde::de::Error::custom("expected exactly one entry"));
                }

                Ok(DataEntry { key, value })
            }
        }

        deserializer.deserialize_map(EntryVisitor)
    }
}

/// Converted device data handed to the platform sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceData {
    /// Device name as registered with the platform.
    #[serde(rename = "deviceName")]
    pub device_name: String,

    /// Device type/profile.
    #[serde(rename = "deviceType")]
    pub device_type: String,

    /// Telemetry pairs, one single-entry map each.
    #[serde(default)]
    pub telemetry: Vec<DataEntry>,

    /// Attribute pairs, one single-entry map each.
    #[serde(default)]
    pub attributes: Vec<DataEntry>,
}

impl DeviceData {
    /// Create an empty result for a device.
    pub fn new(device_name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            device_type: device_type.into(),
            telemetry: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Append a telemetry pair.
    pub fn push_telemetry(&mut self, key: impl Into<String>, value: impl Into<DataValue>) {
        self.telemetry.push(DataEntry::new(key, value));
    }

    /// Append an attribute pair.
    pub fn push_attribute(&mut self, key: impl Into<String>, value: impl Into<DataValue>) {
        self.attributes.push(DataEntry::new(key, value));
    }

    /// True when neither list carries any pair.
    pub fn is_empty(&self) -> bool {
        self.telemetry.is_empty() && self.attributes.is_empty()
    }
}
