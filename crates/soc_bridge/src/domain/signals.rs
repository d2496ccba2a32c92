use gridwatch_frame::DecodedField;

/// Field numbers with a reverse-engineered meaning.
///
/// These were mapped by correlating live captures against the vendor app;
/// nothing about them is guaranteed by the device firmware.
pub const FIELD_SOC: u32 = 6;
pub const FIELD_TEMPERATURE: u32 = 16;
pub const FIELD_GRID_STATUS: u32 = 27;
pub const FIELD_AC_INPUT: u32 = 28;

/// SOC readings are only trusted when nested at least this deep; shallower
/// occurrences of field 6 belong to other message shapes.
pub const SOC_MIN_DEPTH: u8 = 2;
/// Device-level temperature is read at exactly this depth.
pub const TEMPERATURE_DEPTH: u8 = 2;

/// A decoded field classified by its known meaning.
///
/// The wire format has no schema, so every classification is a claim about
/// the field number only; validation of the value happens downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalField {
    /// Field 6: candidate state of charge, percent.
    Soc(u64),
    /// Field 16: temperature in centi-degrees Celsius.
    TemperatureCentiC(u64),
    /// Field 27: grid status enum; the connected threshold is
    /// firmware-revision dependent.
    GridStatus(u64),
    /// Field 28: AC input power, raw scaled-by-10 encoding.
    AcInputRaw(u64),
    /// Anything we have no mapping for.
    Unknown { field_number: u32, value: u64 },
}

impl SignalField {
    pub fn classify(field: &DecodedField) -> Self {
        match field.field_number {
            FIELD_SOC => SignalField::Soc(field.value),
            FIELD_TEMPERATURE => SignalField::TemperatureCentiC(field.value),
            FIELD_GRID_STATUS => SignalField::GridStatus(field.value),
            FIELD_AC_INPUT => SignalField::AcInputRaw(field.value),
            _ => SignalField::Unknown {
                field_number: field.field_number,
                value: field.value,
            },
        }
    }
}

/// Raw values above this are sentinel noise, not power readings.
const POWER_SENTINEL_FLOOR: u64 = 4_294_900_000;

/// Interpret a raw field-28 value as signed watts.
///
/// The device encodes power scaled by 10 with a 16-bit two's-complement
/// style wraparound for negative (feeding-in) values, and uses a couple of
/// sentinel values for "no reading".
pub fn to_signed_watts(raw: u64) -> f64 {
    if raw > POWER_SENTINEL_FLOOR || raw == 0xFFFF {
        return 0.0;
    }
    if raw > 32768 {
        return (raw as f64 - 65536.0) / 10.0;
    }
    raw as f64 / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_fields() {
        let field = DecodedField {
            field_number: FIELD_SOC,
            value: 90,
        };
        assert_eq!(SignalField::classify(&field), SignalField::Soc(90));

        let field = DecodedField {
            field_number: FIELD_GRID_STATUS,
            value: 1,
        };
        assert_eq!(SignalField::classify(&field), SignalField::GridStatus(1));
    }

    #[test]
    fn test_classify_unknown_field() {
        let field = DecodedField {
            field_number: 99,
            value: 7,
        };
        assert_eq!(
            SignalField::classify(&field),
            SignalField::Unknown {
                field_number: 99,
                value: 7
            }
        );
    }

    #[test]
    fn test_positive_power() {
        assert_eq!(to_signed_watts(1234), 123.4);
        assert_eq!(to_signed_watts(0), 0.0);
    }

    #[test]
    fn test_negative_power_wraparound() {
        // 40000 - 65536 = -25536 raw, scaled by 10
        assert_eq!(to_signed_watts(40000), -2553.6);
    }

    #[test]
    fn test_sentinel_values_map_to_zero() {
        assert_eq!(to_signed_watts(0xFFFF), 0.0);
        assert_eq!(to_signed_watts(4_294_967_295), 0.0);
    }

    #[test]
    fn test_boundary_below_wraparound() {
        assert_eq!(to_signed_watts(32768), 3276.8);
    }
}
