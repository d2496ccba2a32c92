use crate::domain::validator::ValidatedReading;
use chrono::{DateTime, Utc};
use gridwatch_common::domain::DeviceSnapshot;
use tracing::{debug, info};

/// How the latched SOC is chosen when several modules report valid values
/// in the same cycle.
///
/// Both variants exist in the field; the tie-break is a stability
/// heuristic with no authoritative answer, so it stays configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocLatchStrategy {
    /// Pick the candidate closest to the current latched value, minimizing
    /// jump size.
    ClosestToPrevious,
    /// Average all valid candidates.
    Average,
}

impl Default for SocLatchStrategy {
    fn default() -> Self {
        SocLatchStrategy::ClosestToPrevious
    }
}

/// Ghost-wattage detector bounds: a reading roughly double the previous one
/// is a double-counted duplicate, not a load change.
const GHOST_RATIO_MIN: f64 = 1.8;
const GHOST_RATIO_MAX: f64 = 2.2;
const GHOST_WATTS_FLOOR: f64 = 10.0;

/// Latched per-device state, owned by the registry for the process
/// lifetime. `soc` and `grid_connected` change only through `apply`.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub serial: String,
    pub soc: f64,
    pub soc_modules: Vec<u32>,
    pub grid_connected: bool,
    pub temp_celsius: f64,
    pub ac_in_watts: f64,
    pub last_update: Option<DateTime<Utc>>,
}

impl DeviceState {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            soc: 0.0,
            soc_modules: Vec::new(),
            grid_connected: true,
            temp_celsius: 0.0,
            ac_in_watts: 0.0,
            last_update: None,
        }
    }

    /// Apply a validated reading. Returns true when anything was applied,
    /// which is also the publish trigger.
    pub fn apply(
        &mut self,
        reading: &ValidatedReading,
        strategy: SocLatchStrategy,
        now: DateTime<Utc>,
    ) -> bool {
        if !reading.has_valid_data() {
            return false;
        }

        if let Some(grid_connected) = reading.grid_connected {
            self.grid_connected = grid_connected;
        }

        if let Some(watts) = reading.ac_in_watts {
            self.apply_power(watts);
        }

        if !reading.module_temps.is_empty() {
            self.temp_celsius =
                reading.module_temps.iter().sum::<f64>() / reading.module_temps.len() as f64;
        }

        if !reading.soc_modules.is_empty() {
            self.latch_soc(&reading.soc_modules, strategy);
        }

        self.last_update = Some(now);
        true
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            ts: self.last_update.map(|t| t.timestamp_millis()).unwrap_or(0),
            device: self.serial.clone(),
            soc: self.soc,
            soc_modules: self.soc_modules.clone(),
            grid_connected: self.grid_connected,
            temp_celsius: self.temp_celsius,
        }
    }

    fn latch_soc(&mut self, candidates: &[u32], strategy: SocLatchStrategy) {
        let chosen = match strategy {
            SocLatchStrategy::ClosestToPrevious => {
                if self.soc == 0.0 {
                    // Never set: optimistic bootstrap to the fullest module.
                    f64::from(*candidates.iter().max().unwrap_or(&0))
                } else {
                    let closest = candidates
                        .iter()
                        .min_by(|a, b| {
                            let da = (f64::from(**a) - self.soc).abs();
                            let db = (f64::from(**b) - self.soc).abs();
                            da.total_cmp(&db)
                        })
                        .copied()
                        .unwrap_or(0);
                    f64::from(closest)
                }
            }
            SocLatchStrategy::Average => {
                let sum: u32 = candidates.iter().sum();
                (f64::from(sum) / candidates.len() as f64 * 100.0).round() / 100.0
            }
        };

        if (chosen - self.soc).abs() > f64::EPSILON {
            debug!(
                serial = %self.serial,
                from = self.soc,
                to = chosen,
                candidates = ?candidates,
                "SOC latched"
            );
        }
        self.soc = chosen;
        self.soc_modules = candidates.to_vec();
        self.soc_modules.sort_unstable_by(|a, b| b.cmp(a));
    }

    fn apply_power(&mut self, watts: f64) {
        if self.ac_in_watts > GHOST_WATTS_FLOOR && watts > GHOST_WATTS_FLOOR {
            let ratio = watts / self.ac_in_watts;
            if ratio > GHOST_RATIO_MIN && ratio < GHOST_RATIO_MAX {
                info!(
                    serial = %self.serial,
                    previous = self.ac_in_watts,
                    rejected = watts,
                    "discarding double-counted wattage duplicate"
                );
                return;
            }
        }
        self.ac_in_watts = watts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(soc_modules: Vec<u32>, temps: Vec<f64>) -> ValidatedReading {
        ValidatedReading {
            soc_modules,
            module_temps: temps,
            grid_connected: None,
            ac_in_watts: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_bootstrap_picks_maximum() {
        let mut state = DeviceState::new("SN1");
        state.apply(
            &reading(vec![85, 92, 90], vec![25.0]),
            SocLatchStrategy::ClosestToPrevious,
            now(),
        );
        assert_eq!(state.soc, 92.0);
        assert_eq!(state.soc_modules, vec![92, 90, 85]);
    }

    #[test]
    fn test_latch_prefers_closest_to_previous() {
        let mut state = DeviceState::new("SN1");
        state.soc = 60.0;
        state.apply(
            &reading(vec![90, 58], vec![25.0]),
            SocLatchStrategy::ClosestToPrevious,
            now(),
        );
        assert_eq!(state.soc, 58.0);
        assert_eq!(state.soc_modules, vec![90, 58]);
    }

    #[test]
    fn test_average_strategy() {
        let mut state = DeviceState::new("SN1");
        state.apply(
            &reading(vec![90, 85], vec![25.0]),
            SocLatchStrategy::Average,
            now(),
        );
        assert_eq!(state.soc, 87.5);
    }

    #[test]
    fn test_temperature_averaged_across_modules() {
        let mut state = DeviceState::new("SN1");
        state.apply(
            &reading(vec![90, 88], vec![25.0, 26.0]),
            SocLatchStrategy::ClosestToPrevious,
            now(),
        );
        assert_eq!(state.temp_celsius, 25.5);
    }

    #[test]
    fn test_ghost_wattage_discarded() {
        let mut state = DeviceState::new("SN1");
        let mut r = reading(vec![], vec![]);
        r.ac_in_watts = Some(150.0);
        state.apply(&r, SocLatchStrategy::ClosestToPrevious, now());
        assert_eq!(state.ac_in_watts, 150.0);

        // Roughly double: double-counted duplicate, keep the previous value.
        r.ac_in_watts = Some(300.0);
        state.apply(&r, SocLatchStrategy::ClosestToPrevious, now());
        assert_eq!(state.ac_in_watts, 150.0);

        // A genuine change outside the ghost band is applied.
        r.ac_in_watts = Some(500.0);
        state.apply(&r, SocLatchStrategy::ClosestToPrevious, now());
        assert_eq!(state.ac_in_watts, 500.0);
    }

    #[test]
    fn test_empty_reading_not_applied() {
        let mut state = DeviceState::new("SN1");
        let applied = state.apply(
            &ValidatedReading::default(),
            SocLatchStrategy::ClosestToPrevious,
            now(),
        );
        assert!(!applied);
        assert!(state.last_update.is_none());
    }

    #[test]
    fn test_grid_update_applied_immediately() {
        let mut state = DeviceState::new("SN1");
        let mut r = ValidatedReading::default();
        r.grid_connected = Some(false);
        assert!(state.apply(&r, SocLatchStrategy::ClosestToPrevious, now()));
        assert!(!state.grid_connected);
    }
}
