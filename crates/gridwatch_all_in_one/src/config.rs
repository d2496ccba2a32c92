use config::{Config, ConfigError, Environment};
use gridwatch_common::telemetry::TelemetryConfig;
use policy_engine::PolicyEngineConfig;
use serde::{Deserialize, Serialize};
use soc_bridge::domain::{RegistryConfig, SocLatchStrategy};
use soc_bridge::SocBridgeConfig;
use tracing::warn;

/// Environment-driven service configuration, `GRIDWATCH_` prefix.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable output
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,

    // MQTT broker
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,

    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    #[serde(default)]
    pub mqtt_username: Option<String>,

    #[serde(default)]
    pub mqtt_password: Option<String>,

    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    /// Base of the device topic tree
    #[serde(default = "default_topic_base")]
    pub topic_base: String,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    // Decoding and validation
    /// Recursion ceiling for the frame walker
    #[serde(default = "default_max_walk_depth")]
    pub max_walk_depth: u8,

    /// Raw grid-status values up to this mean "connected"
    #[serde(default = "default_grid_connected_max_raw")]
    pub grid_connected_max_raw: u64,

    /// SOC latch strategy: "closest" or "average"
    #[serde(default = "default_soc_latch_strategy")]
    pub soc_latch_strategy: String,

    /// Consecutive readings required to flip a confirmed boolean signal
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u32,

    /// Plausible SOC slew rate, percent per minute
    #[serde(default = "default_soc_max_change_per_minute")]
    pub soc_max_change_per_minute: f64,

    // Heartbeat and staleness
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_quota_interval_secs")]
    pub quota_interval_secs: u64,

    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    // Shutdown policy
    /// SOC at or below this, without grid power, is a danger condition
    #[serde(default = "default_soc_min")]
    pub soc_min: f64,

    #[serde(default = "default_shutdown_debounce_secs")]
    pub shutdown_debounce_secs: u64,

    #[serde(default = "default_shutdown_cooldown_secs")]
    pub shutdown_cooldown_secs: u64,

    #[serde(default = "default_max_data_gap_secs")]
    pub max_data_gap_secs: u64,

    #[serde(default = "default_agent_shutdown_delay_secs")]
    pub agent_shutdown_delay_secs: u64,

    /// JSON object mapping device serials to agent ids,
    /// e.g. `{"R331ABC": ["nas", "router"]}`
    #[serde(default = "default_device_to_agents_json")]
    pub device_to_agents_json: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json_logs() -> bool {
    true
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "gridwatch".to_string()
}

fn default_topic_base() -> String {
    "ecoflow".to_string()
}

fn default_max_retry_attempts() -> u32 {
    10
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_max_walk_depth() -> u8 {
    4
}

fn default_grid_connected_max_raw() -> u64 {
    0
}

fn default_soc_latch_strategy() -> String {
    "closest".to_string()
}

fn default_required_confirmations() -> u32 {
    5
}

fn default_soc_max_change_per_minute() -> f64 {
    10.0
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_quota_interval_secs() -> u64 {
    60
}

fn default_staleness_threshold_secs() -> u64 {
    120
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_soc_min() -> f64 {
    10.0
}

fn default_shutdown_debounce_secs() -> u64 {
    180
}

fn default_shutdown_cooldown_secs() -> u64 {
    300
}

fn default_max_data_gap_secs() -> u64 {
    60
}

fn default_agent_shutdown_delay_secs() -> u64 {
    60
}

fn default_device_to_agents_json() -> String {
    "{}".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("GRIDWATCH"))
            .build()?
            .try_deserialize()
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "gridwatch-all-in-one".to_string(),
            log_level: self.log_level.clone(),
            json_logs: self.json_logs,
        }
    }

    pub fn soc_bridge_config(&self) -> SocBridgeConfig {
        let mut registry = RegistryConfig::default();
        registry.max_walk_depth = self.max_walk_depth;
        registry.grid_connected_max_raw = self.grid_connected_max_raw;
        registry.soc_latch_strategy = self.latch_strategy();
        registry.required_confirmations = self.required_confirmations;
        registry.soc_filter.max_change_per_minute = self.soc_max_change_per_minute;
        registry.soc_filter.required_confirmations = self.required_confirmations;

        SocBridgeConfig {
            mqtt_host: self.mqtt_host.clone(),
            mqtt_port: self.mqtt_port,
            mqtt_username: self.mqtt_username.clone(),
            mqtt_password: self.mqtt_password.clone(),
            mqtt_client_id: format!("{}-soc-bridge", self.mqtt_client_id),
            topic_base: self.topic_base.clone(),
            max_retry_attempts: self.max_retry_attempts,
            retry_delay_secs: self.retry_delay_secs,
            ping_interval_secs: self.ping_interval_secs,
            quota_interval_secs: self.quota_interval_secs,
            staleness_threshold_secs: self.staleness_threshold_secs,
            sweep_interval_secs: self.sweep_interval_secs,
            registry,
        }
    }

    pub fn policy_engine_config(&self) -> PolicyEngineConfig {
        let mut policy = policy_engine::domain::PolicyConfig::default();
        policy.soc_min = self.soc_min;
        policy.debounce_secs = self.shutdown_debounce_secs;
        policy.cooldown_secs = self.shutdown_cooldown_secs;
        policy.max_data_gap_secs = self.max_data_gap_secs;
        policy.agent_shutdown_delay_secs = self.agent_shutdown_delay_secs;

        PolicyEngineConfig {
            mqtt_host: self.mqtt_host.clone(),
            mqtt_port: self.mqtt_port,
            mqtt_username: self.mqtt_username.clone(),
            mqtt_password: self.mqtt_password.clone(),
            mqtt_client_id: format!("{}-policy-engine", self.mqtt_client_id),
            topic_base: self.topic_base.clone(),
            max_retry_attempts: self.max_retry_attempts,
            retry_delay_secs: self.retry_delay_secs,
            gap_sweep_interval_secs: default_gap_sweep_interval_secs(),
            policy,
        }
    }

    fn latch_strategy(&self) -> SocLatchStrategy {
        match self.soc_latch_strategy.as_str() {
            "closest" => SocLatchStrategy::ClosestToPrevious,
            "average" => SocLatchStrategy::Average,
            other => {
                warn!(strategy = %other, "unknown SOC latch strategy, using 'closest'");
                SocLatchStrategy::ClosestToPrevious
            }
        }
    }
}

fn default_gap_sweep_interval_secs() -> u64 {
    15
}
