use async_trait::async_trait;
use gridwatch_common::domain::{AgentCommand, CommandProducer, DomainResult};
use rumqttc::{AsyncClient, QoS};
use tracing::debug;

/// Publishes agent commands as JSON to `power-manager/{agent_id}/cmd`.
pub struct MqttCommandProducer {
    client: AsyncClient,
}

impl MqttCommandProducer {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CommandProducer for MqttCommandProducer {
    async fn publish(&self, agent_id: &str, command: &AgentCommand) -> DomainResult<()> {
        let topic = format!("power-manager/{}/cmd", agent_id);
        let payload = serde_json::to_vec(command)?;

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| anyhow::anyhow!("failed to publish command: {}", e))?;

        debug!(topic = %topic, command_id = %command.id, "published agent command");
        Ok(())
    }
}
