use crate::domain::DomainResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Action requested from a remote host agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Shutdown,
    Abort,
}

/// Command sent to a remote host agent on `power-manager/{agent_id}/cmd`.
///
/// The agent is an external collaborator; it only needs this JSON payload
/// to schedule or cancel a local OS shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    /// Unique command id, used by the agent for dedup and abort matching.
    pub id: String,
    pub action: CommandAction,
    /// Grace period the agent applies before the OS action.
    pub delay_sec: u64,
    /// Human-readable trigger reason, for agent-side logging.
    pub reason: String,
    /// Seconds after which a not-yet-executed command must be discarded.
    pub ttl_sec: u64,
}

/// Trait for publishing agent commands to the message broker.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CommandProducer: Send + Sync {
    /// Publish one command to a single agent.
    async fn publish(&self, agent_id: &str, command: &AgentCommand) -> DomainResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_action_serializes_lowercase() {
        let cmd = AgentCommand {
            id: "cmd-1".to_string(),
            action: CommandAction::Shutdown,
            delay_sec: 60,
            reason: "test".to_string(),
            ttl_sec: 300,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["action"], "shutdown");
        assert_eq!(json["delay_sec"], 60);
        assert_eq!(json["ttl_sec"], 300);
    }

    #[test]
    fn test_command_roundtrip() {
        let cmd = AgentCommand {
            id: "cmd-2".to_string(),
            action: CommandAction::Abort,
            delay_sec: 0,
            reason: "Power Restored".to_string(),
            ttl_sec: 300,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: AgentCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }
}
