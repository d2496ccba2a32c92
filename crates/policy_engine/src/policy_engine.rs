use crate::domain::{DeviceAgentMap, PolicyConfig, PolicyService};
use crate::mqtt::{run_state_subscriber, MqttCommandProducer};
use chrono::Utc;
use gridwatch_common::domain::CommandProducer;
use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PolicyEngineConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub topic_base: String,
    pub max_retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub gap_sweep_interval_secs: u64,
    pub policy: PolicyConfig,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: "gridwatch-policy-engine".to_string(),
            topic_base: "ecoflow".to_string(),
            max_retry_attempts: 10,
            retry_delay_secs: 5,
            gap_sweep_interval_secs: 15,
            policy: PolicyConfig::default(),
        }
    }
}

impl PolicyEngineConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Periodically ask the policy service to drop debounce progress for
/// silent devices.
#[instrument(name = "data_gap_sweep", skip_all)]
async fn run_data_gap_sweep(
    config: PolicyEngineConfig,
    service: Arc<PolicyService>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(Duration::from_secs(config.gap_sweep_interval_secs));

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("data gap sweep cancelled");
                return Ok(());
            }
            _ = tick.tick() => {}
        }
        service.sweep_data_gaps(Utc::now()).await;
    }
}

/// Drive the outbound connection's event loop. rumqttc reconnects on the
/// next poll after an error, so failures are logged and retried rather
/// than propagated.
async fn run_publish_eventloop(
    mut eventloop: EventLoop,
    token: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("publish event loop cancelled");
                return Ok(());
            }
            event = eventloop.poll() => {
                if let Err(e) = event {
                    warn!(error = %e, "outbound MQTT connection error, reconnecting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// The policy engine module: state subscriber, decision machine and
/// command publisher.
pub struct PolicyEngineWorker {
    config: PolicyEngineConfig,
    service: Arc<PolicyService>,
    eventloop: EventLoop,
}

impl PolicyEngineWorker {
    pub fn new(config: PolicyEngineConfig, device_map: DeviceAgentMap) -> Self {
        info!("Initializing policy engine module");

        let client_id = format!("{}-pub", config.mqtt_client_id);
        let mut mqtt_options = MqttOptions::new(&client_id, &config.mqtt_host, config.mqtt_port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.mqtt_username, &config.mqtt_password) {
            mqtt_options.set_credentials(user, pass);
        }
        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        let command_producer: Arc<dyn CommandProducer> =
            Arc::new(MqttCommandProducer::new(client));
        let service = Arc::new(PolicyService::new(
            config.policy.clone(),
            device_map,
            command_producer,
        ));

        Self {
            config,
            service,
            eventloop,
        }
    }

    pub fn into_runner_processes(
        self,
    ) -> Vec<
        Box<
            dyn FnOnce(
                    CancellationToken,
                ) -> std::pin::Pin<
                    Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
                > + Send,
        >,
    > {
        vec![
            // Outbound connection driver
            Box::new({
                let eventloop = self.eventloop;
                move |ctx| Box::pin(run_publish_eventloop(eventloop, ctx))
            }),
            // State subscriber
            Box::new({
                let config = self.config.clone();
                let service = Arc::clone(&self.service);
                move |ctx| Box::pin(run_state_subscriber(config, service, ctx))
            }),
            // Data gap sweep
            Box::new({
                let config = self.config;
                let service = self.service;
                move |ctx| Box::pin(run_data_gap_sweep(config, service, ctx))
            }),
        ]
    }
}
