mod config;

use gridwatch_common::telemetry::init_telemetry;
use gridwatch_runner::Runner;
use policy_engine::domain::DeviceAgentMap;
use policy_engine::PolicyEngineWorker;
use soc_bridge::SocBridgeWorker;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
    let config = match config::ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&config.telemetry_config()) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    // A broken agent map means shutdowns would protect nothing. Fail fast.
    let device_map = match DeviceAgentMap::parse(&config.device_to_agents_json) {
        Ok(map) => map,
        Err(e) => {
            tracing::error!(error = %e, "invalid GRIDWATCH_DEVICE_TO_AGENTS_JSON");
            std::process::exit(1);
        }
    };

    info!("Starting gridwatch-all-in-one service");

    let soc_bridge = SocBridgeWorker::new(config.soc_bridge_config());
    let policy_engine = PolicyEngineWorker::new(config.policy_engine_config(), device_map);

    let runner = Runner::new()
        .with_boxed_processes(soc_bridge.into_runner_processes())
        .with_boxed_processes(policy_engine.into_runner_processes())
        .with_closer(|| async {
            info!("Shutdown complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(10));

    runner.run().await;
}
