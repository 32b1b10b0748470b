use async_trait::async_trait;
use farmhand_core::AgentCommand;

/// Addressing by agent id. Implementations resolve the master connection at
/// call time, never from a cached lookup, since the master can change between
/// enqueue and dispatch.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Returns `false` when the agent has no live master or delivery failed.
    async fn send(&self, agent_id: &str, command: &AgentCommand) -> bool;

    async fn has_master(&self, agent_id: &str) -> bool;
}
