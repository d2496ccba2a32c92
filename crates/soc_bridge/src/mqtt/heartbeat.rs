use crate::soc_bridge::{DeviceDirectory, SocBridgeConfig};
use chrono::Utc;
use gridwatch_frame::encode_varint;
use rumqttc::{AsyncClient, QoS};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Keepalive request, keeps the device's MQTT session chatty.
pub const CMD_PING: u64 = 1;
/// "Report everything" request, forces a full telemetry dump.
pub const CMD_QUOTA: u64 = 0;

/// Request-type marker + "android" client identity. Devices only answer
/// requests that carry it.
const ANDROID_SUFFIX: [u8; 10] = [
    0xba, 0x01, 0x07, 0x61, 0x6e, 0x64, 0x72, 0x6f, 0x69, 0x64,
];

/// Forge a device request packet.
///
/// Header submessage (field 1): src 32, dst 32, sequence number, request
/// identity. Command submessage (field 2): the command id. The sequence
/// number is normally the unix timestamp; it is a parameter so tests can
/// pin it.
pub fn forge_request_packet(cmd_id: u64, seq: u64) -> Vec<u8> {
    let mut header = vec![0x10, 0x20, 0x18, 0x20, 0x70];
    header.extend(encode_varint(seq));
    header.extend_from_slice(&ANDROID_SUFFIX);

    let mut command = vec![0x08];
    command.extend(encode_varint(cmd_id));

    let mut packet = vec![0x0a];
    packet.extend(encode_varint(header.len() as u64));
    packet.extend_from_slice(&header);
    packet.push(0x12);
    packet.extend(encode_varint(command.len() as u64));
    packet.extend_from_slice(&command);
    packet
}

/// Run the heartbeat publisher process.
///
/// Pings every known device on the ping interval and sends a quota wakeup
/// on the (longer) quota interval. Quota goes to all three command topics
/// because firmware revisions disagree about which one they honor.
#[instrument(name = "heartbeat_publisher", skip_all)]
pub async fn run_heartbeat_publisher(
    client: AsyncClient,
    config: SocBridgeConfig,
    directory: DeviceDirectory,
    token: CancellationToken,
) -> anyhow::Result<()> {
    info!(
        ping_secs = config.ping_interval_secs,
        quota_secs = config.quota_interval_secs,
        "starting heartbeat publisher"
    );

    let mut ping_tick = tokio::time::interval(Duration::from_secs(config.ping_interval_secs));
    let mut last_quota: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("heartbeat publisher cancelled");
                return Ok(());
            }
            _ = ping_tick.tick() => {}
        }

        let serials = directory.serials().await;
        if serials.is_empty() {
            continue;
        }

        let seq = Utc::now().timestamp() as u64;
        let ping = forge_request_packet(CMD_PING, seq);

        let quota_due = last_quota
            .map(|t| t.elapsed() >= Duration::from_secs(config.quota_interval_secs))
            .unwrap_or(true);
        let quota = if quota_due {
            last_quota = Some(tokio::time::Instant::now());
            Some(forge_request_packet(CMD_QUOTA, seq))
        } else {
            None
        };

        for serial in &serials {
            let set_topic = format!("{}/{}/set", config.topic_base, serial);
            if let Err(e) = client.publish(&set_topic, QoS::AtLeastOnce, false, ping.clone()).await {
                warn!(serial = %serial, error = %e, "failed to publish ping");
                continue;
            }

            if let Some(quota) = &quota {
                for leaf in ["quota", "get", "set"] {
                    let topic = format!("{}/{}/{}", config.topic_base, serial, leaf);
                    if let Err(e) = client
                        .publish(&topic, QoS::AtLeastOnce, false, quota.clone())
                        .await
                    {
                        warn!(serial = %serial, topic = %topic, error = %e, "failed to publish quota wakeup");
                    }
                }
                debug!(serial = %serial, "sent quota wakeup");
            }
        }
    }
}
