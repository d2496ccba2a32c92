use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Tuning for the SOC anomaly filter. Defaults match observed device
/// behavior; all values are runtime configuration.
#[derive(Debug, Clone)]
pub struct SocFilterConfig {
    /// Tier 1 ceiling: max plausible SOC change per minute, percent.
    pub max_change_per_minute: f64,
    /// Changes at or below this are accepted without confirmation. This
    /// absorbs rapid toggling between battery modules (90 -> 89 -> 90) and
    /// ordinary charge noise.
    pub small_delta: f64,
    /// A pending candidate matches a new reading within this tolerance.
    pub pending_match_epsilon: f64,
    /// Consecutive matching readings required to confirm a large change.
    pub required_confirmations: u32,
    /// Median smoothing window length.
    pub window_size: usize,
    /// Gap above which the confirmation window resets (device was offline).
    pub gap_reset_secs: i64,
}

impl Default for SocFilterConfig {
    fn default() -> Self {
        Self {
            max_change_per_minute: 10.0,
            small_delta: 3.0,
            pending_match_epsilon: 0.5,
            required_confirmations: 5,
            window_size: 5,
            gap_reset_secs: 300,
        }
    }
}

/// Multi-tier temporal filter for one device's raw SOC stream.
///
/// Tier 1 rejects physically implausible jumps, tier 2 demands consensus
/// before trusting a large change, tier 3 median-smooths what survives.
/// `None` means "reject this reading, do not publish".
#[derive(Debug)]
pub struct SocFilter {
    serial: String,
    config: SocFilterConfig,
    last_valid: Option<(f64, DateTime<Utc>)>,
    confirmed: Option<f64>,
    pending: Option<f64>,
    confirmation_count: u32,
    recent: VecDeque<f64>,
}

impl SocFilter {
    pub fn new(serial: impl Into<String>, config: SocFilterConfig) -> Self {
        Self {
            serial: serial.into(),
            config,
            last_valid: None,
            confirmed: None,
            pending: None,
            confirmation_count: 0,
            recent: VecDeque::new(),
        }
    }

    pub fn filter(&mut self, raw_soc: f64, timestamp: DateTime<Utc>) -> Option<f64> {
        let (last_soc, last_time) = match self.last_valid {
            Some(anchor) => anchor,
            None => {
                info!(serial = %self.serial, soc = raw_soc, "SOC filter initialized");
                self.accept(raw_soc, timestamp);
                return Some(raw_soc);
            }
        };

        // Reconnection: a long silence invalidates the pending consensus
        // but not the last trusted anchor.
        let gap_secs = (timestamp - last_time).num_seconds();
        if gap_secs > self.config.gap_reset_secs {
            info!(
                serial = %self.serial,
                gap_secs,
                "large time gap, resetting confirmation window"
            );
            self.reset_confirmation();
        }

        // Tier 1: plausibility.
        let delta = (raw_soc - last_soc).abs();
        if delta > self.config.small_delta {
            let rate = self.change_rate(delta, last_time, timestamp);
            if rate > self.config.max_change_per_minute {
                warn!(
                    serial = %self.serial,
                    from = last_soc,
                    to = raw_soc,
                    rate_per_minute = rate,
                    "rejected implausible SOC change"
                );
                return None;
            }
        }

        // Tier 2: confirmation window.
        if !self.check_confirmation(raw_soc) {
            debug!(
                serial = %self.serial,
                pending = raw_soc,
                count = self.confirmation_count,
                required = self.config.required_confirmations,
                "SOC change awaiting confirmation"
            );
            // Stale-but-trusted: callers may re-publish the last confirmed
            // value while consensus builds.
            return self.confirmed;
        }

        // Tier 3: median smoothing over accepted readings.
        let smoothed = self.apply_median(raw_soc);
        self.accept(smoothed, timestamp);
        Some(smoothed)
    }

    fn change_rate(&self, delta: f64, last_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let elapsed_secs = (now - last_time).num_milliseconds() as f64 / 1000.0;
        if elapsed_secs <= 0.0 {
            return 0.0;
        }
        delta / elapsed_secs * 60.0
    }

    fn check_confirmation(&mut self, raw_soc: f64) -> bool {
        if let Some(confirmed) = self.confirmed {
            if (raw_soc - confirmed).abs() <= self.config.small_delta {
                self.reset_confirmation();
                self.confirmed = Some(raw_soc);
                return true;
            }
        }

        match self.pending {
            Some(pending) if (raw_soc - pending).abs() <= self.config.pending_match_epsilon => {
                self.confirmation_count += 1;
                if self.confirmation_count >= self.config.required_confirmations {
                    info!(
                        serial = %self.serial,
                        from = ?self.confirmed,
                        to = raw_soc,
                        readings = self.confirmation_count,
                        "SOC change confirmed"
                    );
                    self.confirmed = Some(raw_soc);
                    self.reset_confirmation();
                    return true;
                }
                false
            }
            _ => {
                self.pending = Some(raw_soc);
                self.confirmation_count = 1;
                false
            }
        }
    }

    fn apply_median(&mut self, raw_soc: f64) -> f64 {
        self.recent.push_back(raw_soc);
        if self.recent.len() > self.config.window_size {
            self.recent.pop_front();
        }
        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            sorted[mid]
        } else {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        }
    }

    fn accept(&mut self, soc: f64, timestamp: DateTime<Utc>) {
        self.last_valid = Some((soc, timestamp));
        if self.confirmed.is_none() {
            self.confirmed = Some(soc);
        }
    }

    fn reset_confirmation(&mut self) {
        self.pending = None;
        self.confirmation_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + offset_ms).unwrap()
    }

    fn filter() -> SocFilter {
        SocFilter::new("TestDevice", SocFilterConfig::default())
    }

    #[test]
    fn test_first_reading_accepted() {
        let mut f = filter();
        assert_eq!(f.filter(90.0, ts(0)), Some(90.0));
    }

    #[test]
    fn test_module_toggle_accepted() {
        // 90 -> 89 -> 90 at 0.1s spacing: every transition is a small
        // delta and none may be rejected.
        let mut f = filter();
        assert_eq!(f.filter(90.0, ts(0)), Some(90.0));
        assert_eq!(f.filter(89.0, ts(100)), Some(89.0));
        // Median of the accepted window [89, 90].
        assert_eq!(f.filter(90.0, ts(200)), Some(89.5));
    }

    #[test]
    fn test_implausible_jump_rejected() {
        let mut f = filter();
        f.filter(90.0, ts(0));
        // 81% in one second is 4860%/min, far past the 10%/min ceiling.
        assert_eq!(f.filter(9.0, ts(1_000)), None);
    }

    #[test]
    fn test_recovery_after_rejection() {
        let mut f = filter();
        f.filter(90.0, ts(0));
        assert_eq!(f.filter(9.0, ts(5_000)), None);
        assert_eq!(f.filter(90.0, ts(10_000)), Some(90.0));
    }

    #[test]
    fn test_large_change_requires_confirmation() {
        // A plausible-rate large drop returns the stale confirmed value
        // until five consecutive readings agree.
        let mut f = filter();
        f.filter(90.0, ts(0));

        // 80% after 1 minute: rate 10%/min, tier 1 passes, tier 2 holds.
        let mut outputs = Vec::new();
        for i in 0..5 {
            outputs.push(f.filter(80.0, ts(60_000 + i * 10_000)));
        }
        assert_eq!(outputs[0], Some(90.0));
        assert_eq!(outputs[1], Some(90.0));
        assert_eq!(outputs[2], Some(90.0));
        assert_eq!(outputs[3], Some(90.0));
        // Fifth consecutive reading confirms; median window is [80].
        assert_eq!(outputs[4], Some(80.0));
    }

    #[test]
    fn test_differing_large_delta_restarts_confirmation() {
        let mut f = filter();
        f.filter(90.0, ts(0));
        f.filter(80.0, ts(60_000));
        f.filter(80.0, ts(70_000));
        // A different candidate restarts the counter at 1.
        assert_eq!(f.filter(75.0, ts(150_000)), Some(90.0));
        for i in 0..3 {
            assert_eq!(f.filter(75.0, ts(160_000 + i * 10_000)), Some(90.0));
        }
        // Fifth consecutive 75 confirms.
        assert_eq!(f.filter(75.0, ts(190_000)), Some(75.0));
    }

    #[test]
    fn test_gap_resets_confirmation_window() {
        let mut f = filter();
        f.filter(90.0, ts(0));
        f.filter(80.0, ts(60_000));
        f.filter(80.0, ts(70_000));
        f.filter(80.0, ts(80_000));
        f.filter(80.0, ts(90_000));
        // Over five minutes of silence: the pending count must restart, so
        // this fifth matching reading does not confirm.
        assert_eq!(f.filter(80.0, ts(90_000 + 301_000)), Some(90.0));
    }

    #[test]
    fn test_median_smooths_outlier() {
        let mut f = filter();
        assert_eq!(f.filter(88.0, ts(0)), Some(88.0));
        assert_eq!(f.filter(89.0, ts(10_000)), Some(89.0));
        // 89 -> 85 in 10s is 24%/min: tier 1 rejects the outlier outright.
        assert_eq!(f.filter(85.0, ts(20_000)), None);
        // 90 is within the small-delta band of the 89 anchor; the output
        // is the median of the accepted window [89, 90].
        assert_eq!(f.filter(90.0, ts(30_000)), Some(89.5));
        assert_eq!(f.filter(89.0, ts(40_000)), Some(89.0));
    }
}
