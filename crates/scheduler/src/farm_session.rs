use chrono::{DateTime, Utc};
use farmhand_core::FarmSettings;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    /// Looping, waiting for the next cycle.
    Running,
    /// Frozen by a bot-protection page until someone resumes it.
    Paused,
    /// A cycle is in flight on the agent.
    Farming,
    /// The in-flight cycle went silent; a retry is armed.
    Stalled,
}

impl RunState {
    /// Everything but `Idle` counts as started.
    pub fn is_started(self) -> bool {
        !matches!(self, RunState::Idle)
    }

    pub fn is_in_cycle(self) -> bool {
        matches!(self, RunState::Farming | RunState::Stalled)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Farming => "farming",
            RunState::Stalled => "stalled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
}

/// Snapshot of one agent's farming loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmSession {
    pub agent_id: String,
    pub run_state: RunState,
    pub settings: FarmSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub cycles_completed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_stats: serde_json::Value,
}

impl FarmSession {
    pub fn new(agent_id: &str, settings: FarmSettings) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            run_state: RunState::Idle,
            settings,
            current_correlation_id: None,
            progress: None,
            next_run_at: None,
            last_error: None,
            cycles_completed: 0,
            last_completed_at: None,
            last_stats: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryOutcome {
    Accepted,
    /// Unknown agent, stale correlation id, or no cycle in flight.
    Ignored,
}
