/// Configuration for telemetry initialization
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output.
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "gridwatch".to_string(),
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}
