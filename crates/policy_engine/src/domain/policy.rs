use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// SOC at or below this, without grid power, is a danger condition.
    pub soc_min: f64,
    /// Danger must persist this long before a shutdown fires.
    pub debounce_secs: u64,
    /// Minimum spacing between shutdown commands for one device.
    pub cooldown_secs: u64,
    /// Silence longer than this resets the debounce accumulator.
    pub max_data_gap_secs: u64,
    /// Grace period the agent waits before powering off.
    pub agent_shutdown_delay_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            soc_min: 10.0,
            debounce_secs: 180,
            cooldown_secs: 300,
            max_data_gap_secs: 60,
            agent_shutdown_delay_secs: 60,
        }
    }
}

/// An intent the policy machine wants carried out for a device.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyAction {
    Shutdown { reason: String },
    Abort { reason: String },
}

#[derive(Debug, Default)]
struct DevicePolicyState {
    danger_since: Option<DateTime<Utc>>,
    /// Set when a shutdown was issued and not yet aborted or expired.
    shutdown_sent_at: Option<DateTime<Utc>>,
    last_shutdown: Option<DateTime<Utc>>,
    last_message: Option<DateTime<Utc>>,
}

/// Debounced shutdown/abort decision machine, one state slot per device.
///
/// A device is in danger when it is off grid with SOC at or below the
/// minimum. Danger must hold through the debounce window before a shutdown
/// fires, and a cooldown keeps the machine from re-firing while agents are
/// still reacting. Recovery inside the abort window cancels the shutdown.
#[derive(Debug)]
pub struct PolicyMachine {
    config: PolicyConfig,
    devices: HashMap<String, DevicePolicyState>,
}

impl PolicyMachine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            devices: HashMap::new(),
        }
    }

    /// Fold one state report into the machine and return the actions it
    /// demands.
    pub fn evaluate(
        &mut self,
        device: &str,
        soc: f64,
        grid_connected: bool,
        now: DateTime<Utc>,
    ) -> Vec<PolicyAction> {
        let soc_min = self.config.soc_min;
        let debounce = Duration::seconds(self.config.debounce_secs as i64);
        let cooldown = Duration::seconds(self.config.cooldown_secs as i64);
        let abort_window =
            Duration::seconds((self.config.agent_shutdown_delay_secs + 60) as i64);

        let max_gap = Duration::seconds(self.config.max_data_gap_secs as i64);

        let state = self.devices.entry(device.to_string()).or_default();
        let previous_message = state.last_message.replace(now);

        let danger = !grid_connected && soc <= soc_min;
        let mut actions = Vec::new();

        // A silence longer than the gap invalidates any accumulated danger:
        // the condition may have cleared and returned while we were blind.
        // Skip this cycle entirely so danger is re-observed from scratch.
        if let Some(previous) = previous_message {
            if now - previous > max_gap {
                if state.danger_since.is_some() {
                    warn!(
                        device,
                        gap_secs = (now - previous).num_seconds(),
                        "data gap before message, resetting debounce"
                    );
                    state.danger_since = None;
                }
                return actions;
            }
        }

        if danger {
            let since = *state.danger_since.get_or_insert(now);
            let held = now - since;

            if held < debounce {
                debug!(
                    device,
                    soc,
                    held_secs = held.num_seconds(),
                    debounce_secs = self.config.debounce_secs,
                    "danger condition accumulating"
                );
                return actions;
            }

            // The cooldown alone gates re-firing: while danger persists the
            // machine re-issues a shutdown every cooldown period, in case
            // an earlier command was lost or expired.
            let cooling = state
                .last_shutdown
                .map(|t| now - t < cooldown)
                .unwrap_or(false);
            if cooling {
                return actions;
            }

            let reason = format!(
                "battery at {:.1}% with grid power lost for {}s",
                soc,
                held.num_seconds()
            );
            warn!(device, soc, %reason, "danger confirmed, requesting shutdown");
            state.last_shutdown = Some(now);
            state.shutdown_sent_at = Some(now);
            actions.push(PolicyAction::Shutdown { reason });
        } else {
            state.danger_since = None;

            if let Some(sent_at) = state.shutdown_sent_at.take() {
                if now - sent_at <= abort_window {
                    // An aborted shutdown also releases the cooldown: a
                    // fresh danger episode only has to hold the debounce.
                    state.last_shutdown = None;
                    let reason = if grid_connected {
                        format!("grid power restored, battery at {:.1}%", soc)
                    } else {
                        format!("battery recovered to {:.1}%", soc)
                    };
                    info!(device, soc, %reason, "danger cleared, requesting abort");
                    actions.push(PolicyAction::Abort { reason });
                } else {
                    // Too late, the agent has already powered off.
                    debug!(device, "recovery arrived after the abort window");
                }
            }
        }

        actions
    }

    /// Drop stale debounce progress for devices that have gone silent.
    /// Danger must be re-observed from scratch once data resumes.
    pub fn sweep_data_gaps(&mut self, now: DateTime<Utc>) {
        let max_gap = Duration::seconds(self.config.max_data_gap_secs as i64);
        for (device, state) in &mut self.devices {
            let gap_exceeded = state
                .last_message
                .map(|t| now - t > max_gap)
                .unwrap_or(false);
            if gap_exceeded && state.danger_since.is_some() {
                warn!(
                    device,
                    gap_secs = self.config.max_data_gap_secs,
                    "data gap during danger accumulation, resetting debounce"
                );
                state.danger_since = None;
            }
        }
    }
}
