use async_trait::async_trait;
use gridwatch_common::domain::{DeviceSnapshot, DomainResult, SnapshotPublisher};
use rumqttc::{AsyncClient, QoS};
use tracing::debug;

/// Publishes device snapshots as JSON to `{base}/{serial}/json/state`.
pub struct MqttSnapshotPublisher {
    client: AsyncClient,
    topic_base: String,
}

impl MqttSnapshotPublisher {
    pub fn new(client: AsyncClient, topic_base: impl Into<String>) -> Self {
        Self {
            client,
            topic_base: topic_base.into(),
        }
    }
}

#[async_trait]
impl SnapshotPublisher for MqttSnapshotPublisher {
    async fn publish(&self, snapshot: &DeviceSnapshot) -> DomainResult<()> {
        let topic = format!("{}/{}/json/state", self.topic_base, snapshot.device);
        let payload = serde_json::to_vec(snapshot)?;

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| anyhow::anyhow!("failed to publish snapshot: {}", e))?;

        debug!(topic = %topic, soc = snapshot.soc, "published device snapshot");
        Ok(())
    }
}
