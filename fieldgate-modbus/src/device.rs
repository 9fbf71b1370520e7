//! Device registry and per-device runtime state.
//!
//! One entry is created per configured device at startup and never
//! removed. Configuration is read-only after load; the runtime state
//! (poll deadlines, last-forwarded caches) is mutated by the poll loop
//! and read by the RPC dispatcher under the connector's lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use fieldgate_common::data::{DataValue, DeviceData};

use crate::config::{DeviceConfig, ItemConfig};
use crate::converter::{ConversionError, ConverterRegistry, DownlinkConverter, UplinkConverter};

/// A device's poll groups, each with its own period and schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataGroup {
    Telemetry,
    Attributes,
}

impl DataGroup {
    pub const ALL: [DataGroup; 2] = [DataGroup::Telemetry, DataGroup::Attributes];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataGroup::Telemetry => "telemetry",
            DataGroup::Attributes => "attributes",
        }
    }
}

/// Mutable runtime state of one device.
#[derive(Debug, Default)]
pub struct DeviceState {
    next_telemetry_poll: Option<Instant>,
    next_attributes_poll: Option<Instant>,
    last_telemetry: HashMap<String, DataValue>,
    last_attributes: HashMap<String, DataValue>,
}

impl DeviceState {
    fn next_poll(&self, group: DataGroup) -> Option<Instant> {
        match group {
            DataGroup::Telemetry => self.next_telemetry_poll,
            DataGroup::Attributes => self.next_attributes_poll,
        }
    }

    /// Whether the group's poll deadline has elapsed. A group that has
    /// never been polled is due immediately.
    pub fn is_due(&self, group: DataGroup, now: Instant) -> bool {
        match self.next_poll(group) {
            None => true,
            Some(deadline) => deadline <= now,
        }
    }

    /// Advance the group's deadline to one period past the tick time.
    pub fn reschedule(&mut self, group: DataGroup, now: Instant, period: Duration) {
        let next = Some(now + period);
        match group {
            DataGroup::Telemetry => self.next_telemetry_poll = next,
            DataGroup::Attributes => self.next_attributes_poll = next,
        }
    }

    /// Keep only the pairs that are new or differ from the cached,
    /// last-forwarded values. The caches themselves are untouched;
    /// call [`commit`](Self::commit) once the forward succeeded.
    pub fn changed_only(&self, data: &DeviceData) -> DeviceData {
        let mut filtered = DeviceData::new(&data.device_name, &data.device_type);

        for entry in &data.telemetry {
            if self.last_telemetry.get(&entry.key) != Some(&entry.value) {
                filtered.telemetry.push(entry.clone());
            }
        }
        for entry in &data.attributes {
            if self.last_attributes.get(&entry.key) != Some(&entry.value) {
                filtered.attributes.push(entry.clone());
            }
        }

        filtered
    }

    /// Replace a group's cache with exactly the forwarded pairs,
    /// dropping tags the converter no longer emits. Used when change
    /// detection is disabled and the full batch was forwarded.
    pub fn overwrite(&mut self, group: DataGroup, forwarded: &DeviceData) {
        let (cache, entries) = match group {
            DataGroup::Telemetry => (&mut self.last_telemetry, &forwarded.telemetry),
            DataGroup::Attributes => (&mut self.last_attributes, &forwarded.attributes),
        };
        *cache = entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect();
    }

    /// Record forwarded pairs in the last-forwarded caches.
    pub fn commit(&mut self, forwarded: &DeviceData) {
        for entry in &forwarded.telemetry {
            self.last_telemetry
                .insert(entry.key.clone(), entry.value.clone());
        }
        for entry in &forwarded.attributes {
            self.last_attributes
                .insert(entry.key.clone(), entry.value.clone());
        }
    }
}

/// One configured device with its resolved conversion strategies and
/// runtime state.
pub struct Device {
    pub config: DeviceConfig,
    pub uplink: Arc<dyn UplinkConverter>,
    pub downlink: Arc<dyn DownlinkConverter>,
    pub state: DeviceState,
}

impl Device {
    /// Item descriptors of a poll group.
    pub fn items(&self, group: DataGroup) -> &[ItemConfig] {
        match group {
            DataGroup::Telemetry => &self.config.telemetry,
            DataGroup::Attributes => &self.config.attributes,
        }
    }

    /// Poll period of a group.
    pub fn poll_period(&self, group: DataGroup) -> Duration {
        let millis = match group {
            DataGroup::Telemetry => self.config.telemetry_poll_period_ms,
            DataGroup::Attributes => self.config.attributes_poll_period_ms,
        };
        Duration::from_millis(millis)
    }
}

/// All configured devices, iterated in configuration order.
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    /// Build the registry, resolving each device's conversion
    /// strategies by name.
    pub fn from_config(
        configs: &[DeviceConfig],
        converters: &ConverterRegistry,
    ) -> Result<Self, ConversionError> {
        let mut devices = Vec::with_capacity(configs.len());
        for config in configs {
            let uplink = converters.resolve_uplink(config.converter.as_deref())?;
            let downlink = converters.resolve_downlink(config.downlink_converter.as_deref())?;
            devices.push(Device {
                config: config.clone(),
                uplink,
                downlink,
                state: DeviceState::default(),
            });
        }
        Ok(Self { devices })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut()
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.config.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_common::data::DataEntry;

    fn sample_data(temp: i64) -> DeviceData {
        let mut data = DeviceData::new("Device A", "default");
        data.push_telemetry("temp", DataValue::Integer(temp));
        data
    }

    #[test]
    fn test_unpolled_group_is_due() {
        let state = DeviceState::default();
        let now = Instant::now();
        assert!(state.is_due(DataGroup::Telemetry, now));
        assert!(state.is_due(DataGroup::Attributes, now));
    }

    #[test]
    fn test_reschedule_moves_deadline_forward() {
        let mut state = DeviceState::default();
        let now = Instant::now();
        let period = Duration::from_millis(500);

        state.reschedule(DataGroup::Telemetry, now, period);
        assert!(!state.is_due(DataGroup::Telemetry, now));
        assert!(!state.is_due(DataGroup::Telemetry, now + Duration::from_millis(499)));
        assert!(state.is_due(DataGroup::Telemetry, now + period));

        // groups are independent
        assert!(state.is_due(DataGroup::Attributes, now));
    }

    #[test]
    fn test_changed_only_first_poll_forwards_everything() {
        let state = DeviceState::default();
        let filtered = state.changed_only(&sample_data(21));
        assert_eq!(filtered.telemetry.len(), 1);
    }

    #[test]
    fn test_changed_only_suppresses_identical_values() {
        let mut state = DeviceState::default();
        let first = sample_data(21);

        let filtered = state.changed_only(&first);
        assert!(!filtered.is_empty());
        state.commit(&filtered);

        // same value again: nothing to forward
        let filtered = state.changed_only(&sample_data(21));
        assert!(filtered.is_empty());

        // changed value: forwarded again
        let filtered = state.changed_only(&sample_data(22));
        assert_eq!(
            filtered.telemetry,
            vec![DataEntry::new("temp", DataValue::Integer(22))]
        );
    }

    #[test]
    fn test_cache_unchanged_until_commit() {
        let mut state = DeviceState::default();
        let data = sample_data(21);

        // diffing twice without commit keeps forwarding
        assert!(!state.changed_only(&data).is_empty());
        assert!(!state.changed_only(&data).is_empty());

        state.commit(&data);
        assert!(state.changed_only(&data).is_empty());
    }

    #[test]
    fn test_overwrite_drops_stale_tags() {
        let mut state = DeviceState::default();

        let mut first = DeviceData::new("d", "t");
        first.push_telemetry("a", DataValue::Integer(1));
        first.push_telemetry("b", DataValue::Integer(2));
        state.overwrite(DataGroup::Telemetry, &first);

        // the converter stops emitting "b": overwrite evicts it
        let mut second = DeviceData::new("d", "t");
        second.push_telemetry("a", DataValue::Integer(1));
        state.overwrite(DataGroup::Telemetry, &second);

        let mut third = DeviceData::new("d", "t");
        third.push_telemetry("b", DataValue::Integer(2));
        assert_eq!(state.changed_only(&third).telemetry.len(), 1);

        // merge-style commit would have kept "b" cached
        state.commit(&first);
        assert!(state.changed_only(&third).is_empty());
    }

    #[test]
    fn test_telemetry_and_attribute_caches_are_separate() {
        let mut state = DeviceState::default();
        let mut data = DeviceData::new("d", "t");
        data.push_telemetry("k", DataValue::Integer(1));
        state.commit(&data);

        let mut attr = DeviceData::new("d", "t");
        attr.push_attribute("k", DataValue::Integer(1));
        let filtered = state.changed_only(&attr);
        assert_eq!(filtered.attributes.len(), 1);
    }
}
