use crate::domain::DeviceRegistry;
use crate::mqtt::parse_topic;
use crate::soc_bridge::{DeviceDirectory, SocBridgeConfig};
use gridwatch_common::domain::{DomainError, DomainResult, SnapshotPublisher};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

/// Run the telemetry subscriber process.
///
/// Subscribes to the device data and reply topics, decodes each payload and
/// publishes the resulting snapshots. The registry lives here, outside the
/// session, so device state survives broker reconnects.
#[instrument(name = "telemetry_subscriber", skip_all)]
pub async fn run_telemetry_subscriber(
    config: SocBridgeConfig,
    snapshot_publisher: Arc<dyn SnapshotPublisher>,
    directory: DeviceDirectory,
    token: CancellationToken,
) -> anyhow::Result<()> {
    info!(
        host = %config.mqtt_host,
        port = config.mqtt_port,
        topic_base = %config.topic_base,
        "starting telemetry subscriber"
    );

    let mut registry = DeviceRegistry::new(config.registry.clone());
    let mut retry_count = 0;

    loop {
        if token.is_cancelled() {
            debug!("telemetry subscriber cancelled before connection");
            break;
        }

        match run_mqtt_session(
            &config,
            &mut registry,
            Arc::clone(&snapshot_publisher),
            &directory,
            &token,
        )
        .await
        {
            Ok(()) => {
                debug!("telemetry subscriber stopped cleanly");
                break;
            }
            Err(e) => {
                error!(error = %e, "MQTT session error");

                retry_count += 1;
                if retry_count >= config.max_retry_attempts {
                    error!(
                        max_retries = config.max_retry_attempts,
                        "max retry attempts reached, stopping telemetry subscriber"
                    );
                    anyhow::bail!("telemetry subscriber exhausted retries: {}", e);
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

    info!("telemetry subscriber stopped");
    Ok(())
}

async fn run_mqtt_session(
    config: &SocBridgeConfig,
    registry: &mut DeviceRegistry,
    snapshot_publisher: Arc<dyn SnapshotPublisher>,
    directory: &DeviceDirectory,
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

    for leaf in ["data", "get_reply", "set_reply"] {
        let filter = format!("{}/+/{}", config.topic_base, leaf);
        client
            .subscribe(&filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                DomainError::TransportError(anyhow::anyhow!("failed to subscribe: {}", e))
            })?;
        info!(filter = %filter, "subscribed to device topic");
    }

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
                        handle_device_message(
                            config,
                            registry,
                            &publish.topic,
                            &publish.payload,
                            Arc::clone(&snapshot_publisher),
                            directory,
                        )
                        .await;
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

/// Handle one inbound device message under its own root span.
async fn handle_device_message(
    config: &SocBridgeConfig,
    registry: &mut DeviceRegistry,
    topic: &str,
    payload: &[u8],
    snapshot_publisher: Arc<dyn SnapshotPublisher>,
    directory: &DeviceDirectory,
) {
    let span = info_span!(
        parent: Span::none(),
        "device_message",
        topic = %topic,
        payload_size = payload.len(),
        serial = tracing::field::Empty,
    );

    async {
        let parsed = match parse_topic(topic, &config.topic_base) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to parse device topic, skipping message");
                return;
            }
        };
        Span::current().record("serial", parsed.serial.as_str());

        let now = chrono::Utc::now();
        directory.touch(&parsed.serial, now).await;

        let Some(snapshot) = registry.handle_payload(&parsed.serial, payload, now) else {
            return;
        };

        if let Err(e) = snapshot_publisher.publish(&snapshot).await {
            error!(error = %e, "failed to publish device snapshot");
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridwatch_common::domain::MockSnapshotPublisher;
    use gridwatch_frame::encode_varint;

    fn test_config() -> SocBridgeConfig {
        SocBridgeConfig::default()
    }

    /// One frame with a single battery module at SOC 90, temp 25 C.
    fn valid_payload() -> Vec<u8> {
        let mut module = encode_varint(6 << 3);
        module.extend(encode_varint(90));
        module.extend(encode_varint(16 << 3));
        module.extend(encode_varint(2500));

        let mut envelope = encode_varint((3 << 3) | 2);
        envelope.extend(encode_varint(module.len() as u64));
        envelope.extend(&module);

        let mut frame = encode_varint((2 << 3) | 2);
        frame.extend(encode_varint(envelope.len() as u64));
        frame.extend(&envelope);

        let mut payload = encode_varint(frame.len() as u64);
        payload.extend(&frame);
        payload
    }

    #[tokio::test]
    async fn test_valid_message_published() {
        let config = test_config();
        let mut registry = DeviceRegistry::new(config.registry.clone());
        let directory = DeviceDirectory::default();

        let mut mock = MockSnapshotPublisher::new();
        mock.expect_publish()
            .withf(|s| s.device == "SN1" && s.soc == 90.0)
            .times(1)
            .returning(|_| Ok(()));
        let publisher: Arc<dyn SnapshotPublisher> = Arc::new(mock);

        handle_device_message(
            &config,
            &mut registry,
            "ecoflow/SN1/data",
            &valid_payload(),
            publisher,
            &directory,
        )
        .await;

        assert_eq!(directory.serials().await, vec!["SN1".to_string()]);
    }

    #[tokio::test]
    async fn test_foreign_topic_ignored() {
        let config = test_config();
        let mut registry = DeviceRegistry::new(config.registry.clone());
        let directory = DeviceDirectory::default();

        let mut mock = MockSnapshotPublisher::new();
        mock.expect_publish().times(0);
        let publisher: Arc<dyn SnapshotPublisher> = Arc::new(mock);

        handle_device_message(
            &config,
            &mut registry,
            "unrelated/topic",
            &valid_payload(),
            publisher,
            &directory,
        )
        .await;

        assert!(directory.serials().await.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_payload_not_published() {
        let config = test_config();
        let mut registry = DeviceRegistry::new(config.registry.clone());
        let directory = DeviceDirectory::default();

        let mut mock = MockSnapshotPublisher::new();
        mock.expect_publish().times(0);
        let publisher: Arc<dyn SnapshotPublisher> = Arc::new(mock);

        handle_device_message(
            &config,
            &mut registry,
            "ecoflow/SN1/data",
            &[0xFF, 0xFF, 0xFF],
            publisher,
            &directory,
        )
        .await;
    }
}
