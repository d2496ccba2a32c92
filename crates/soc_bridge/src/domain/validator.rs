use crate::domain::signals::{
    to_signed_watts, SignalField, FIELD_GRID_STATUS, SOC_MIN_DEPTH, TEMPERATURE_DEPTH,
};
use gridwatch_frame::FieldGroup;
use tracing::{debug, trace};

/// Everything extracted from one decoded message, after semantic
/// validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedReading {
    /// Accepted per-module SOC values, in the order the modules appeared.
    pub soc_modules: Vec<u32>,
    /// Temperatures of the accepted modules, degrees Celsius.
    pub module_temps: Vec<f64>,
    pub grid_connected: Option<bool>,
    pub ac_in_watts: Option<f64>,
}

impl ValidatedReading {
    /// True when ANY field update was found. Liveness is prioritized over
    /// strict correctness: an idle device should still look alive.
    pub fn has_valid_data(&self) -> bool {
        !self.soc_modules.is_empty()
            || self.grid_connected.is_some()
            || self.ac_in_watts.is_some()
    }
}

/// Maps field groups to domain signals and rejects ghost and imposter
/// readings.
#[derive(Debug, Clone)]
pub struct BmsValidator {
    /// Raw grid-status values up to and including this mean "connected".
    /// Firmware revisions disagree on the exact convention (`==0` vs
    /// `<=1`), so the threshold is configuration, not code.
    grid_connected_max_raw: u64,
}

impl BmsValidator {
    pub fn new(grid_connected_max_raw: u64) -> Self {
        Self {
            grid_connected_max_raw,
        }
    }

    /// Validate one decoded message (possibly spanning several module-like
    /// sub-message groups, each checked independently).
    pub fn validate(&self, serial: &str, groups: &[FieldGroup]) -> ValidatedReading {
        let mut reading = ValidatedReading::default();

        for group in groups {
            let mut soc: Option<u64> = None;
            let mut temp: Option<u64> = None;

            for field in &group.fields {
                match SignalField::classify(field) {
                    SignalField::Soc(value) if group.depth >= SOC_MIN_DEPTH => {
                        soc = Some(value);
                    }
                    SignalField::Soc(value) => {
                        trace!(serial, value, depth = group.depth, "ignoring shallow SOC field");
                    }
                    SignalField::TemperatureCentiC(value) => {
                        temp = Some(value);
                    }
                    SignalField::GridStatus(value) => {
                        reading.grid_connected = Some(value <= self.grid_connected_max_raw);
                    }
                    SignalField::AcInputRaw(value) => {
                        reading.ac_in_watts = Some(to_signed_watts(value));
                    }
                    SignalField::Unknown { .. } => {}
                }
            }

            if let Some(soc) = soc {
                if self.module_is_valid(serial, soc, temp) {
                    reading.soc_modules.push(soc as u32);
                    if let Some(temp) = temp {
                        if group.depth == TEMPERATURE_DEPTH {
                            reading.module_temps.push(temp as f64 / 100.0);
                        }
                    }
                }
            }
        }

        reading
    }

    /// Module validity predicate. A module's SOC is accepted only when the
    /// whole signature looks like a real battery module.
    fn module_is_valid(&self, serial: &str, soc: u64, temp: Option<u64>) -> bool {
        // Range check: SOC is a percentage.
        if soc > 100 {
            debug!(serial, soc, "rejected SOC out of range");
            return false;
        }

        // Ghost check: an empty slot reports SOC 0 with no temperature.
        if soc == 0 && temp.unwrap_or(0) == 0 {
            debug!(serial, "rejected ghost module (SOC 0, no temperature)");
            return false;
        }

        // Imposter check: real temperatures are centi-degrees (2500 =
        // 25.0C); values in (0,100) are status enums leaking into the same
        // field number in a different message shape.
        if let Some(temp) = temp {
            if temp > 0 && temp < 100 {
                debug!(serial, temp, "rejected enum-as-temperature imposter");
                return false;
            }
        }

        // Real battery modules always report temperature; SOC without it is
        // a disconnected or partial ghost.
        if temp.is_none() {
            debug!(serial, soc, "rejected SOC without temperature");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signals::{FIELD_AC_INPUT, FIELD_SOC, FIELD_TEMPERATURE};
    use gridwatch_frame::DecodedField;

    fn group(depth: u8, fields: &[(u32, u64)]) -> FieldGroup {
        FieldGroup {
            depth,
            fields: fields
                .iter()
                .map(|&(field_number, value)| DecodedField {
                    field_number,
                    value,
                })
                .collect(),
        }
    }

    fn validator() -> BmsValidator {
        BmsValidator::new(0)
    }

    #[test]
    fn test_valid_module_accepted() {
        let groups = vec![group(2, &[(FIELD_SOC, 90), (FIELD_TEMPERATURE, 2500)])];
        let reading = validator().validate("SN1", &groups);
        assert_eq!(reading.soc_modules, vec![90]);
        assert_eq!(reading.module_temps, vec![25.0]);
        assert!(reading.has_valid_data());
    }

    #[test]
    fn test_ghost_module_rejected() {
        // One valid module and one empty slot: only the real one counts.
        let groups = vec![
            group(2, &[(FIELD_SOC, 90), (FIELD_TEMPERATURE, 2500)]),
            group(2, &[(FIELD_SOC, 0), (FIELD_TEMPERATURE, 0)]),
        ];
        let reading = validator().validate("SN1", &groups);
        assert_eq!(reading.soc_modules, vec![90]);
    }

    #[test]
    fn test_out_of_range_soc_rejected() {
        let groups = vec![group(2, &[(FIELD_SOC, 320), (FIELD_TEMPERATURE, 2500)])];
        let reading = validator().validate("SN1", &groups);
        assert!(reading.soc_modules.is_empty());
        assert!(!reading.has_valid_data());
    }

    #[test]
    fn test_imposter_temperature_rejected() {
        // Temperature 3 is a status enum, not 0.03 degrees.
        let groups = vec![group(2, &[(FIELD_SOC, 45), (FIELD_TEMPERATURE, 3)])];
        let reading = validator().validate("SN1", &groups);
        assert!(reading.soc_modules.is_empty());
    }

    #[test]
    fn test_soc_without_temperature_rejected() {
        let groups = vec![group(2, &[(FIELD_SOC, 45)])];
        let reading = validator().validate("SN1", &groups);
        assert!(reading.soc_modules.is_empty());
    }

    #[test]
    fn test_shallow_soc_ignored() {
        let groups = vec![group(1, &[(FIELD_SOC, 90), (FIELD_TEMPERATURE, 2500)])];
        let reading = validator().validate("SN1", &groups);
        assert!(reading.soc_modules.is_empty());
    }

    #[test]
    fn test_grid_threshold_is_configurable() {
        let groups = vec![group(1, &[(FIELD_GRID_STATUS, 1)])];

        // Strict firmware convention: only 0 means connected.
        let reading = BmsValidator::new(0).validate("SN1", &groups);
        assert_eq!(reading.grid_connected, Some(false));

        // Lenient convention: 0 and 1 both mean connected.
        let reading = BmsValidator::new(1).validate("SN1", &groups);
        assert_eq!(reading.grid_connected, Some(true));
    }

    #[test]
    fn test_power_extracted_at_any_depth() {
        let groups = vec![group(0, &[(FIELD_AC_INPUT, 1234)])];
        let reading = validator().validate("SN1", &groups);
        assert_eq!(reading.ac_in_watts, Some(123.4));
        assert!(reading.has_valid_data());
    }

    #[test]
    fn test_grid_only_message_is_valid_data() {
        let groups = vec![group(1, &[(FIELD_GRID_STATUS, 2)])];
        let reading = validator().validate("SN1", &groups);
        assert_eq!(reading.grid_connected, Some(false));
        assert!(reading.has_valid_data());
    }
}
