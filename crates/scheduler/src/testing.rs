//! Test doubles shared by the scheduler tests.
use async_trait::async_trait;
use farmhand_channels::AgentTransport;
use farmhand_core::message::{ACTION_FARM_BEGIN, ACTION_FARM_HALT};
use farmhand_core::AgentCommand;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Transport whose agents are "connected" by name; records every delivered command.
pub(crate) struct FakeTransport {
    connected: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, AgentCommand)>>,
    stalled: Mutex<HashSet<String>>,
}

impl FakeTransport {
    pub fn new(agents: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            connected: Mutex::new(agents.iter().map(|a| a.to_string()).collect()),
            sent: Mutex::new(Vec::new()),
            stalled: Mutex::new(HashSet::new()),
        })
    }

    pub fn disconnect(&self, agent_id: &str) {
        self.connected.lock().unwrap().remove(agent_id);
    }

    /// Sends to `agent_id` never complete, like a socket nobody drains.
    pub fn stall(&self, agent_id: &str) {
        self.stalled.lock().unwrap().insert(agent_id.to_string());
    }

    pub fn commands(&self, agent_id: &str) -> Vec<AgentCommand> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == agent_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Correlation ids of every farm.begin delivered to `agent_id`, in order.
    pub fn begins(&self, agent_id: &str) -> Vec<String> {
        self.commands(agent_id)
            .into_iter()
            .filter(|c| c.action == ACTION_FARM_BEGIN)
            .filter_map(|c| c.correlation_id)
            .collect()
    }

    pub fn halts(&self, agent_id: &str) -> usize {
        self.commands(agent_id)
            .iter()
            .filter(|c| c.action == ACTION_FARM_HALT)
            .count()
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn send(&self, agent_id: &str, command: &AgentCommand) -> bool {
        if !self.connected.lock().unwrap().contains(agent_id) {
            return false;
        }
        let stalled = self.stalled.lock().unwrap().contains(agent_id);
        if stalled {
            std::future::pending::<()>().await;
        }
        self.sent
            .lock()
            .unwrap()
            .push((agent_id.to_string(), command.clone()));
        true
    }

    async fn has_master(&self, agent_id: &str) -> bool {
        self.connected.lock().unwrap().contains(agent_id)
    }
}
