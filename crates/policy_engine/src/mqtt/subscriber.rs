use crate::domain::PolicyService;
use crate::policy_engine::PolicyEngineConfig;
use gridwatch_common::domain::{DeviceSnapshot, DomainError, DomainResult};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

/// Run the state subscriber process.
///
/// Listens on `{base}/+/json/state` and feeds each snapshot into the
/// policy service. Malformed snapshots are ignored, the publisher side is
/// not under our control.
#[instrument(name = "state_subscriber", skip_all)]
pub async fn run_state_subscriber(
    config: PolicyEngineConfig,
    service: Arc<PolicyService>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    info!(
        host = %config.mqtt_host,
        port = config.mqtt_port,
        topic_base = %config.topic_base,
        "starting state subscriber"
    );

    let mut retry_count = 0;

    loop {
        if token.is_cancelled() {
            debug!("state subscriber cancelled before connection");
            break;
        }

        match run_mqtt_session(&config, Arc::clone(&service), &token).await {
            Ok(()) => {
                debug!("state subscriber stopped cleanly");
                break;
            }
            Err(e) => {
                error!(error = %e, "MQTT session error");

                retry_count += 1;
                if retry_count >= config.max_retry_attempts {
                    error!(
                        max_retries = config.max_retry_attempts,
                        "max retry attempts reached, stopping state subscriber"
                    );
                    anyhow::bail!("state subscriber exhausted retries: {}", e);
                }

                warn!(
                    attempt = retry_count,
                    max_attempts = config.max_retry_attempts,
                    "retrying MQTT connection"
                );

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(config.retry_delay()) => {}
                }
            }
        }
    }

    info!("state subscriber stopped");
    Ok(())
}

async fn run_mqtt_session(
    config: &PolicyEngineConfig,
    service: Arc<PolicyService>,
    token: &CancellationToken,
) -> DomainResult<()> {
    let client_id = format!("{}-sub", config.mqtt_client_id);
    let mut mqtt_options = MqttOptions::new(&client_id, &config.mqtt_host, config.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);
    if let (Some(user), Some(pass)) = (&config.mqtt_username, &config.mqtt_password) {
        mqtt_options.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    let filter = format!("{}/+/json/state", config.topic_base);
    client
        .subscribe(&filter, QoS::AtLeastOnce)
        .await
        .map_err(|e| DomainError::TransportError(anyhow::anyhow!("failed to subscribe: {}", e)))?;
    info!(filter = %filter, "subscribed to state topic");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("cancellation received");
                let _ = client.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_state_message(&publish.topic, &publish.payload, &service).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(DomainError::TransportError(
                            anyhow::anyhow!("MQTT event loop error: {}", e),
                        ));
                    }
                }
            }
        }
    }
}

async fn handle_state_message(topic: &str, payload: &[u8], service: &PolicyService) {
    let span = info_span!(
        parent: Span::none(),
        "state_message",
        topic = %topic,
        payload_size = payload.len(),
    );

    async {
        let snapshot: DeviceSnapshot = match serde_json::from_slice(payload) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "ignoring malformed state payload");
                return;
            }
        };

        service.handle_snapshot(&snapshot, chrono::Utc::now()).await;
    }
    .instrument(span)
    .await
}
