use crate::domain::device_state::{DeviceState, SocLatchStrategy};
use crate::domain::soc_filter::{SocFilter, SocFilterConfig};
use crate::domain::state_filter::BooleanStateFilter;
use crate::domain::validator::BmsValidator;
use chrono::{DateTime, Utc};
use gridwatch_common::domain::DeviceSnapshot;
use gridwatch_frame::{split_frames, walk_groups, FieldGroup};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Tuning for the decode-to-snapshot pipeline.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Recursion ceiling for the frame walker.
    pub max_walk_depth: u8,
    /// Grid-status values up to this are "connected" (firmware dependent).
    pub grid_connected_max_raw: u64,
    pub soc_latch_strategy: SocLatchStrategy,
    pub soc_filter: SocFilterConfig,
    /// Consecutive readings required to flip a confirmed boolean signal.
    pub required_confirmations: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_walk_depth: 4,
            grid_connected_max_raw: 0,
            soc_latch_strategy: SocLatchStrategy::default(),
            soc_filter: SocFilterConfig::default(),
            required_confirmations: 5,
        }
    }
}

struct DeviceEntry {
    state: DeviceState,
    soc_filter: SocFilter,
    grid_filter: BooleanStateFilter,
    /// Last filtered SOC that made it into a snapshot.
    published_soc: f64,
}

/// Owns all per-device state: latched aggregates plus the temporal
/// filters. Constructed once at startup and driven by the single message
/// loop, so no interior locking is needed.
pub struct DeviceRegistry {
    config: RegistryConfig,
    validator: BmsValidator,
    devices: HashMap<String, DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let validator = BmsValidator::new(config.grid_connected_max_raw);
        Self {
            config,
            validator,
            devices: HashMap::new(),
        }
    }

    /// Decode one inbound payload for a device and fold it into the
    /// device's state.
    ///
    /// Returns a snapshot to publish when the message contained valid
    /// data, `None` otherwise. Decode failures never propagate: a frame
    /// that does not parse simply contributes nothing.
    #[instrument(skip(self, payload), fields(payload_size = payload.len()))]
    pub fn handle_payload(
        &mut self,
        serial: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Option<DeviceSnapshot> {
        let frames = split_frames(payload);
        if frames.is_empty() {
            debug!(serial, "payload contained no complete frames");
            return None;
        }

        let mut groups: Vec<FieldGroup> = Vec::new();
        for frame in frames {
            groups.extend(walk_groups(frame, self.config.max_walk_depth));
        }

        let reading = self.validator.validate(serial, &groups);
        if !reading.has_valid_data() {
            debug!(serial, "no recognized signals in message");
            return None;
        }

        let latch_strategy = self.config.soc_latch_strategy;
        let entry = self.entry(serial);
        if !entry.state.apply(&reading, latch_strategy, now) {
            return None;
        }

        // Grid smoothing is delegated here rather than the aggregator: the
        // aggregator latches raw values, the snapshot carries the
        // confirmed ones.
        let grid_connected = entry.grid_filter.filter(entry.state.grid_connected, now);

        if !reading.soc_modules.is_empty() {
            if let Some(filtered) = entry.soc_filter.filter(entry.state.soc, now) {
                entry.published_soc = filtered;
            }
            // On rejection the previous published value is retained:
            // rejected readings must never reach DeviceState consumers.
        } else if entry.published_soc == 0.0 {
            entry.published_soc = entry.state.soc;
        }

        let mut snapshot = entry.state.snapshot();
        snapshot.soc = entry.published_soc;
        snapshot.grid_connected = grid_connected;
        Some(snapshot)
    }

    fn entry(&mut self, serial: &str) -> &mut DeviceEntry {
        let soc_filter_config = self.config.soc_filter.clone();
        let required_confirmations = self.config.required_confirmations;
        self.devices
            .entry(serial.to_string())
            .or_insert_with(|| DeviceEntry {
                state: DeviceState::new(serial),
                soc_filter: SocFilter::new(serial, soc_filter_config),
                grid_filter: BooleanStateFilter::new(
                    serial,
                    "grid_connected",
                    required_confirmations,
                ),
                published_soc: 0.0,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signals::{FIELD_AC_INPUT, FIELD_GRID_STATUS, FIELD_SOC, FIELD_TEMPERATURE};
    use chrono::TimeZone;
    use gridwatch_frame::encode_varint;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap()
    }

    fn varint_field(field_number: u32, value: u64) -> Vec<u8> {
        let mut out = encode_varint(u64::from(field_number) << 3);
        out.extend(encode_varint(value));
        out
    }

    fn message_field(field_number: u32, inner: &[u8]) -> Vec<u8> {
        let mut out = encode_varint(u64::from(field_number) << 3 | 2);
        out.extend(encode_varint(inner.len() as u64));
        out.extend_from_slice(inner);
        out
    }

    fn frame_payload(frame: &[u8]) -> Vec<u8> {
        let mut payload = encode_varint(frame.len() as u64);
        payload.extend_from_slice(frame);
        payload
    }

    /// Build a device message: envelope (field 2) containing module
    /// sub-messages (modules land at depth 2), grid and power at depth 1.
    fn device_frame(modules: &[(u64, u64)], grid: Option<u64>, power: Option<u64>) -> Vec<u8> {
        let mut envelope = Vec::new();
        for &(soc, temp) in modules {
            let mut module = varint_field(FIELD_SOC, soc);
            module.extend(varint_field(FIELD_TEMPERATURE, temp));
            envelope.extend(message_field(3, &module));
        }
        if let Some(grid) = grid {
            envelope.extend(varint_field(FIELD_GRID_STATUS, grid));
        }
        if let Some(power) = power {
            envelope.extend(varint_field(FIELD_AC_INPUT, power));
        }
        frame_payload(&message_field(2, &envelope))
    }

    #[test]
    fn test_multi_module_with_ghost() {
        let mut registry = DeviceRegistry::new(RegistryConfig::default());
        let payload = device_frame(&[(90, 2500), (0, 0)], Some(0), None);

        let snapshot = registry.handle_payload("SN1", &payload, ts(0)).unwrap();
        assert_eq!(snapshot.soc_modules, vec![90]);
        assert_eq!(snapshot.soc, 90.0);
        assert!(snapshot.grid_connected);
        assert_eq!(snapshot.temp_celsius, 25.0);
    }

    #[test]
    fn test_identical_message_idempotent() {
        let mut registry = DeviceRegistry::new(RegistryConfig::default());
        let payload = device_frame(&[(88, 2500)], Some(0), Some(1500));

        let first = registry.handle_payload("SN1", &payload, ts(0)).unwrap();
        let second = registry.handle_payload("SN1", &payload, ts(1)).unwrap();
        assert_eq!(first.soc, second.soc);
        assert_eq!(first.grid_connected, second.grid_connected);
    }

    #[test]
    fn test_rejected_soc_keeps_published_value() {
        let mut registry = DeviceRegistry::new(RegistryConfig::default());

        let snapshot = registry
            .handle_payload("SN1", &device_frame(&[(90, 2500)], None, None), ts(0))
            .unwrap();
        assert_eq!(snapshot.soc, 90.0);

        // An implausible drop is filtered out; the snapshot re-publishes
        // the trusted value.
        let snapshot = registry
            .handle_payload("SN1", &device_frame(&[(9, 2500)], None, None), ts(1))
            .unwrap();
        assert_eq!(snapshot.soc, 90.0);
    }

    #[test]
    fn test_grid_loss_needs_confirmation() {
        let mut registry = DeviceRegistry::new(RegistryConfig::default());
        registry
            .handle_payload("SN1", &device_frame(&[(80, 2500)], Some(0), None), ts(0))
            .unwrap();

        // Four disconnected readings are suppressed, the fifth flips.
        for i in 1..=4 {
            let snap = registry
                .handle_payload("SN1", &device_frame(&[(80, 2500)], Some(2), None), ts(i))
                .unwrap();
            assert!(snap.grid_connected, "reading {i} should be suppressed");
        }
        let snap = registry
            .handle_payload("SN1", &device_frame(&[(80, 2500)], Some(2), None), ts(5))
            .unwrap();
        assert!(!snap.grid_connected);
    }

    #[test]
    fn test_unparseable_payload_yields_nothing() {
        let mut registry = DeviceRegistry::new(RegistryConfig::default());
        assert!(registry.handle_payload("SN1", &[0xFF, 0xFF], ts(0)).is_none());
        assert!(registry.handle_payload("SN1", &[], ts(0)).is_none());
    }
}
