use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Generic N-consecutive-reading debounce for a noisy binary signal.
///
/// Used for grid-connection status, where single-message glitches are
/// common and a false "grid lost" can cascade into a shutdown decision.
/// Until a change is confirmed the filter keeps returning the previous
/// confirmed state, never the transient raw value.
#[derive(Debug)]
pub struct BooleanStateFilter {
    serial: String,
    state_name: &'static str,
    required_confirmations: u32,
    gap_reset_secs: i64,
    confirmed: Option<bool>,
    pending: Option<bool>,
    confirmation_count: u32,
    last_update: Option<DateTime<Utc>>,
}

impl BooleanStateFilter {
    pub fn new(
        serial: impl Into<String>,
        state_name: &'static str,
        required_confirmations: u32,
    ) -> Self {
        Self {
            serial: serial.into(),
            state_name,
            required_confirmations,
            gap_reset_secs: 300,
            confirmed: None,
            pending: None,
            confirmation_count: 0,
            last_update: None,
        }
    }

    pub fn filter(&mut self, raw_value: bool, timestamp: DateTime<Utc>) -> bool {
        let confirmed = match self.confirmed {
            Some(confirmed) => confirmed,
            None => {
                info!(
                    serial = %self.serial,
                    state = self.state_name,
                    value = raw_value,
                    "state filter initialized"
                );
                self.accept(raw_value, timestamp);
                return raw_value;
            }
        };

        // A long silence invalidates the pending window but keeps the
        // confirmed state: the device may have rebooted mid-transition.
        if let Some(last) = self.last_update {
            let gap_secs = (timestamp - last).num_seconds();
            if gap_secs > self.gap_reset_secs {
                info!(
                    serial = %self.serial,
                    state = self.state_name,
                    gap_secs,
                    "large time gap, resetting confirmation window"
                );
                self.reset_confirmation();
            }
        }

        if raw_value == confirmed {
            if self.pending.is_some() {
                debug!(
                    serial = %self.serial,
                    state = self.state_name,
                    value = raw_value,
                    "returned to confirmed state"
                );
                self.reset_confirmation();
            }
            self.last_update = Some(timestamp);
            return confirmed;
        }

        if self.pending != Some(raw_value) {
            self.pending = Some(raw_value);
            self.confirmation_count = 1;
        } else {
            self.confirmation_count += 1;
        }

        debug!(
            serial = %self.serial,
            state = self.state_name,
            from = confirmed,
            to = raw_value,
            count = self.confirmation_count,
            required = self.required_confirmations,
            "state change awaiting confirmation"
        );

        if self.confirmation_count >= self.required_confirmations {
            warn!(
                serial = %self.serial,
                state = self.state_name,
                from = confirmed,
                to = raw_value,
                readings = self.confirmation_count,
                "state change confirmed"
            );
            self.accept(raw_value, timestamp);
            self.reset_confirmation();
            return raw_value;
        }

        self.last_update = Some(timestamp);
        confirmed
    }

    fn accept(&mut self, value: bool, timestamp: DateTime<Utc>) {
        self.confirmed = Some(value);
        self.last_update = Some(timestamp);
    }

    fn reset_confirmation(&mut self) {
        self.pending = None;
        self.confirmation_count = 0;
    }
}
