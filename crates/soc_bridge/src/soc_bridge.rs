use crate::domain::RegistryConfig;
use crate::mqtt::{run_heartbeat_publisher, run_telemetry_subscriber, MqttSnapshotPublisher};
use chrono::{DateTime, Utc};
use gridwatch_common::domain::SnapshotPublisher;
use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct SocBridgeConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub topic_base: String,
    pub max_retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub ping_interval_secs: u64,
    pub quota_interval_secs: u64,
    pub staleness_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    pub registry: RegistryConfig,
}

impl Default for SocBridgeConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: "gridwatch-soc-bridge".to_string(),
            topic_base: "ecoflow".to_string(),
            max_retry_attempts: 10,
            retry_delay_secs: 5,
            ping_interval_secs: 10,
            quota_interval_secs: 60,
            staleness_threshold_secs: 120,
            sweep_interval_secs: 30,
            registry: RegistryConfig::default(),
        }
    }
}

impl SocBridgeConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Shared view of which devices have been heard from and when. Fed by the
/// subscriber, read by the heartbeat publisher and the staleness sweep.
#[derive(Clone, Default)]
pub struct DeviceDirectory {
    inner: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl DeviceDirectory {
    pub async fn touch(&self, serial: &str, now: DateTime<Utc>) {
        self.inner.lock().await.insert(serial.to_string(), now);
    }

    pub async fn serials(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    /// Devices whose last message is older than the threshold, with the
    /// age in seconds.
    pub async fn stale(&self, now: DateTime<Utc>, threshold_secs: u64) -> Vec<(String, i64)> {
        self.inner
            .lock()
            .await
            .iter()
            .filter_map(|(serial, last)| {
                let age = (now - *last).num_seconds();
                (age > threshold_secs as i64).then(|| (serial.clone(), age))
            })
            .collect()
    }
}

/// Periodically warn about devices that have gone quiet. Visibility only,
/// the policy engine applies its own data-gap handling.
#[instrument(name = "staleness_sweep", skip_all)]
pub async fn run_staleness_sweep(
    config: SocBridgeConfig,
    directory: DeviceDirectory,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("staleness sweep cancelled");
                return Ok(());
            }
            _ = tick.tick() => {}
        }

        let now = Utc::now();
        for (serial, age_secs) in directory.stale(now, config.staleness_threshold_secs).await {
            warn!(
                serial = %serial,
                age_secs,
                threshold_secs = config.staleness_threshold_secs,
                "no telemetry from device"
            );
        }
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

/// The SOC bridge module: telemetry subscriber, snapshot publisher,
/// heartbeat publisher and staleness sweep.
pub struct SocBridgeWorker {
    config: SocBridgeConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    directory: DeviceDirectory,
}

impl SocBridgeWorker {
    pub fn new(config: SocBridgeConfig) -> Self {
        info!("Initializing SOC bridge module");

        let client_id = format!("{}-pub", config.mqtt_client_id);
        let mut mqtt_options = MqttOptions::new(&client_id, &config.mqtt_host, config.mqtt_port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.mqtt_username, &config.mqtt_password) {
            mqtt_options.set_credentials(user, pass);
        }
        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Self {
            config,
            client,
            eventloop,
            directory: DeviceDirectory::default(),
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
        let snapshot_publisher: Arc<dyn SnapshotPublisher> = Arc::new(MqttSnapshotPublisher::new(
            self.client.clone(),
            self.config.topic_base.clone(),
        ));

        vec![
            // Outbound connection driver
            Box::new({
                let eventloop = self.eventloop;
                move |ctx| Box::pin(run_publish_eventloop(eventloop, ctx))
            }),
            // Telemetry subscriber
            Box::new({
                let config = self.config.clone();
                let directory = self.directory.clone();
                move |ctx| {
                    Box::pin(run_telemetry_subscriber(
                        config,
                        snapshot_publisher,
                        directory,
                        ctx,
                    ))
                }
            }),
            // Heartbeat publisher
            Box::new({
                let config = self.config.clone();
                let client = self.client.clone();
                let directory = self.directory.clone();
                move |ctx| Box::pin(run_heartbeat_publisher(client, config, directory, ctx))
            }),
            // Staleness sweep
            Box::new({
                let config = self.config;
                let directory = self.directory;
                move |ctx| Box::pin(run_staleness_sweep(config, directory, ctx))
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_directory_staleness() {
        let directory = DeviceDirectory::default();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        directory.touch("SN1", t0).await;
        directory.touch("SN2", t0 + chrono::Duration::seconds(100)).await;

        let now = t0 + chrono::Duration::seconds(130);
        let stale = directory.stale(now, 120).await;
        assert_eq!(stale, vec![("SN1".to_string(), 130)]);
    }

    #[tokio::test]
    async fn test_touch_refreshes_entry() {
        let directory = DeviceDirectory::default();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        directory.touch("SN1", t0).await;
        directory.touch("SN1", t0 + chrono::Duration::seconds(200)).await;

        let now = t0 + chrono::Duration::seconds(250);
        assert!(directory.stale(now, 120).await.is_empty());
        assert_eq!(directory.serials().await.len(), 1);
    }
}
