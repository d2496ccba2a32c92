use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::TelemetryConfig;

/// Initialize the tracing subscriber for a service.
///
/// `RUST_LOG` takes precedence over the configured log level so operators
/// can raise verbosity per-target without redeploying.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.json_logs {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    tracing::debug!(service = %config.service_name, "telemetry initialized");
    Ok(())
}
