//! Decoded readings and the per-slot telemetry cache
//! The cache keeps the latest value of every field, the control mirror and the device tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::codec::{self, ControlValues};
use crate::core::registry::{ChannelDescriptor, DeviceFamily};
use crate::error::CodecError;

/// One decoded characteristic read
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub channel: &'static str,
    pub family: DeviceFamily,
    pub values: BTreeMap<&'static str, f64>,
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    pub fn get(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    latest: HashMap<&'static str, BTreeMap<&'static str, f64>>,
    device_tick: Option<u16>,
}

/// Latest values for one connection slot.
///
/// Control channels are mirrored here too, so partial writes can be completed
/// from the last known state and guards can check flags without a read.
#[derive(Debug)]
pub struct TelemetryCache {
    family: DeviceFamily,
    state: Mutex<CacheState>,
}

impl TelemetryCache {
    pub fn new(family: DeviceFamily) -> Self {
        Self {
            family,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decodes a payload for `channel`, then records its values and tick.
    pub fn ingest(
        &self,
        channel: &'static ChannelDescriptor,
        payload: &[u8],
    ) -> Result<Reading, CodecError> {
        let reading = codec::decode_channel(payload, self.family, channel)?;
        let mut state = self.lock();
        if let Some(tick) = codec::read_tick(payload) {
            state.device_tick = Some(tick);
        }
        state.latest.insert(reading.channel, reading.values.clone());
        Ok(reading)
    }

    pub fn value(&self, channel: &str, field: &str) -> Option<f64> {
        self.lock()
            .latest
            .get(channel)
            .and_then(|values| values.get(field).copied())
    }

    /// Last tick reported by the peripheral.
    pub fn tick(&self) -> Option<u16> {
        self.lock().device_tick
    }

    /// Current mirror of a control channel as integer values.
    pub fn control_values(&self, channel: &ChannelDescriptor) -> ControlValues {
        let state = self.lock();
        let Some(values) = state.latest.get(channel.name) else {
            return ControlValues::new();
        };
        values
            .iter()
            .map(|(name, value)| (name.to_string(), value.round() as i64))
            .collect()
    }

    /// Stores values that were just written to a control channel.
    pub fn merge_control(&self, channel: &'static ChannelDescriptor, values: &ControlValues) {
        let mut state = self.lock();
        let mirror = state.latest.entry(channel.name).or_default();
        for field in channel.fields {
            if let Some(value) = values.get(field.name) {
                mirror.insert(field.name, *value as f64);
            }
        }
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.latest.clear();
        state.device_tick = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::lookup;

    #[test]
    fn test_ingest_updates_values_and_tick() {
        let cache = TelemetryCache::new(DeviceFamily::Cor);
        let soc = lookup(DeviceFamily::Cor, "soc").unwrap();
        let reading = cache.ingest(soc, &[0x00, 0x2A, 0, 0x32, 0, 0x64, 0, 0, 0, 0]).unwrap();

        assert_eq!(reading.get("soc"), Some(50.0));
        assert_eq!(cache.value("soc", "ext1_soc"), Some(100.0));
        assert_eq!(cache.tick(), Some(42));
    }

    #[test]
    fn test_failed_ingest_leaves_cache_untouched() {
        let cache = TelemetryCache::new(DeviceFamily::Cor);
        let soc = lookup(DeviceFamily::Cor, "soc").unwrap();
        assert!(cache.ingest(soc, &[0x00, 0x2A, 0]).is_err());
        assert_eq!(cache.tick(), None);
        assert_eq!(cache.value("soc", "soc"), None);
    }

    #[test]
    fn test_control_mirror() {
        let cache = TelemetryCache::new(DeviceFamily::Cor);
        let current = lookup(DeviceFamily::Cor, "current").unwrap();
        cache.ingest(current, &[0x04, 0xD2, 0x05]).unwrap();

        let mirror = cache.control_values(current);
        assert_eq!(mirror.get("system_on"), Some(&1));
        assert_eq!(mirror.get("ac_on"), Some(&0));
        assert_eq!(mirror.get("dc_on"), Some(&1));

        let update: ControlValues = [("ac_on".to_string(), 1)].into_iter().collect();
        cache.merge_control(current, &update);
        assert_eq!(cache.value("current", "ac_on"), Some(1.0));

        cache.clear();
        assert!(cache.control_values(current).is_empty());
    }
}
