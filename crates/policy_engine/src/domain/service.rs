use crate::domain::device_map::DeviceAgentMap;
use crate::domain::policy::{PolicyAction, PolicyConfig, PolicyMachine};
use chrono::{DateTime, Utc};
use gridwatch_common::domain::{AgentCommand, CommandAction, CommandProducer, DeviceSnapshot};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

const COMMAND_TTL_SECS: u64 = 300;

/// Ties the policy machine to the agent map and the command transport.
/// Snapshot handling and the data-gap sweep run on different tasks, so
/// the machine sits behind a lock.
pub struct PolicyService {
    config: PolicyConfig,
    machine: Mutex<PolicyMachine>,
    device_map: DeviceAgentMap,
    command_producer: Arc<dyn CommandProducer>,
}

impl PolicyService {
    pub fn new(
        config: PolicyConfig,
        device_map: DeviceAgentMap,
        command_producer: Arc<dyn CommandProducer>,
    ) -> Self {
        if device_map.is_empty() {
            warn!("device-to-agent map is empty, decisions will be logged but reach no agents");
        }
        let machine = Mutex::new(PolicyMachine::new(config.clone()));
        Self {
            config,
            machine,
            device_map,
            command_producer,
        }
    }

    pub async fn handle_snapshot(&self, snapshot: &DeviceSnapshot, now: DateTime<Utc>) {
        let actions = self
            .machine
            .lock()
            .await
            .evaluate(&snapshot.device, snapshot.soc, snapshot.grid_connected, now);

        for action in actions {
            self.dispatch(&snapshot.device, action).await;
        }
    }

    pub async fn sweep_data_gaps(&self, now: DateTime<Utc>) {
        self.machine.lock().await.sweep_data_gaps(now);
    }

    async fn dispatch(&self, device: &str, action: PolicyAction) {
        let (action_kind, delay_sec, reason) = match action {
            PolicyAction::Shutdown { reason } => (
                CommandAction::Shutdown,
                self.config.agent_shutdown_delay_secs,
                reason,
            ),
            PolicyAction::Abort { reason } => (CommandAction::Abort, 0, reason),
        };

        let agents = self.device_map.agents_for(device);
        if agents.is_empty() {
            warn!(device, action = ?action_kind, "no agents mapped to device, command dropped");
            return;
        }

        for agent_id in agents {
            let command = AgentCommand {
                id: Uuid::new_v4().to_string(),
                action: action_kind,
                delay_sec,
                reason: reason.clone(),
                ttl_sec: COMMAND_TTL_SECS,
            };

            match self.command_producer.publish(agent_id, &command).await {
                Ok(()) => {
                    info!(
                        device,
                        agent_id = %agent_id,
                        action = ?action_kind,
                        command_id = %command.id,
                        "agent command published"
                    );
                }
                Err(e) => {
                    error!(
                        device,
                        agent_id = %agent_id,
                        action = ?action_kind,
                        error = %e,
                        "failed to publish agent command"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gridwatch_common::domain::MockCommandProducer;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap()
    }

    fn snapshot(device: &str, soc: f64, grid_connected: bool) -> DeviceSnapshot {
        DeviceSnapshot {
            ts: 0,
            device: device.to_string(),
            soc,
            soc_modules: vec![soc as u32],
            grid_connected,
            temp_celsius: 25.0,
        }
    }

    #[tokio::test]
    async fn test_shutdown_fans_out_to_all_agents() {
        let mut mock = MockCommandProducer::new();
        mock.expect_publish()
            .withf(|agent_id, cmd| {
                (agent_id == "nas" || agent_id == "router")
                    && cmd.action == CommandAction::Shutdown
                    && cmd.delay_sec == 60
                    && cmd.ttl_sec == 300
            })
            .times(2)
            .returning(|_, _| Ok(()));

        let service = PolicyService::new(
            PolicyConfig::default(),
            DeviceAgentMap::parse(r#"{"SN1": ["nas", "router"]}"#).unwrap(),
            Arc::new(mock),
        );

        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(0)).await;
        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(60)).await;
        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(120)).await;
        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(180)).await;
    }

    #[tokio::test]
    async fn test_abort_uses_zero_delay() {
        let mut mock = MockCommandProducer::new();
        mock.expect_publish()
            .withf(|_, cmd| cmd.action == CommandAction::Shutdown)
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_publish()
            .withf(|_, cmd| cmd.action == CommandAction::Abort && cmd.delay_sec == 0)
            .times(1)
            .returning(|_, _| Ok(()));

        let service = PolicyService::new(
            PolicyConfig::default(),
            DeviceAgentMap::parse(r#"{"SN1": ["nas"]}"#).unwrap(),
            Arc::new(mock),
        );

        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(0)).await;
        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(60)).await;
        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(120)).await;
        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(180)).await;
        service.handle_snapshot(&snapshot("SN1", 5.0, true), ts(200)).await;
    }

    #[tokio::test]
    async fn test_unmapped_device_publishes_nothing() {
        let mut mock = MockCommandProducer::new();
        mock.expect_publish().times(0);

        let service = PolicyService::new(
            PolicyConfig::default(),
            DeviceAgentMap::parse(r#"{"SN1": ["nas"]}"#).unwrap(),
            Arc::new(mock),
        );

        service.handle_snapshot(&snapshot("SN9", 5.0, false), ts(0)).await;
        service.handle_snapshot(&snapshot("SN9", 5.0, false), ts(180)).await;
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_fatal() {
        let mut mock = MockCommandProducer::new();
        mock.expect_publish()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("broker unavailable").into()));

        let service = PolicyService::new(
            PolicyConfig::default(),
            DeviceAgentMap::parse(r#"{"SN1": ["nas"]}"#).unwrap(),
            Arc::new(mock),
        );

        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(0)).await;
        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(60)).await;
        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(120)).await;
        service.handle_snapshot(&snapshot("SN1", 5.0, false), ts(180)).await;
    }
}
