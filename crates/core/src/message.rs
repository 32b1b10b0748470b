use serde::{Deserialize, Serialize};

use crate::types::{FarmSettings, SessionRole};

pub const ACTION_FARM_BEGIN: &str = "farm.begin";
pub const ACTION_FARM_HALT: &str = "farm.halt";
pub const ACTION_SESSION_ROLE: &str = "session.role";

/// Error codes the agent uses when a bot-protection page blocks it.
const INTERSTITIAL_CODES: &[&str] = &["interstitial", "anti_bot", "captcha"];

/// A command sent to a remote agent. The core never looks inside `payload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentCommand {
    pub id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AgentCommand {
    pub fn new(action: &str, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action: action.to_string(),
            correlation_id: None,
            payload,
        }
    }

    pub fn farm_begin(correlation_id: &str, settings: &FarmSettings) -> Self {
        Self {
            correlation_id: Some(correlation_id.to_string()),
            ..Self::new(
                ACTION_FARM_BEGIN,
                serde_json::json!({
                    "intervalMinutes": settings.interval_minutes,
                    "jitterMinutes": settings.jitter_minutes,
                }),
            )
        }
    }

    pub fn farm_halt() -> Self {
        Self::new(ACTION_FARM_HALT, serde_json::Value::Null)
    }

    pub fn session_role(session_id: &str, role: SessionRole) -> Self {
        Self::new(
            ACTION_SESSION_ROLE,
            serde_json::json!({
                "sessionId": session_id,
                "role": role,
                "isMaster": role == SessionRole::Master,
            }),
        )
    }

    /// Wire frame as written to the agent socket.
    pub fn to_frame(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "command",
            "command": self,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Progress {
        current: u32,
        total: u32,
    },
    Complete {
        #[serde(default)]
        stats: serde_json::Value,
    },
    Error {
        code: String,
        #[serde(default)]
        message: String,
    },
}

impl TelemetryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::Progress { .. } => "progress",
            TelemetryEvent::Complete { .. } => "complete",
            TelemetryEvent::Error { .. } => "error",
        }
    }

    pub fn is_interstitial(&self) -> bool {
        match self {
            TelemetryEvent::Error { code, .. } => INTERSTITIAL_CODES
                .iter()
                .any(|c| code.eq_ignore_ascii_case(c)),
            _ => false,
        }
    }

    /// Progress and completion prove the remote operation actually started.
    pub fn confirms_start(&self) -> bool {
        matches!(
            self,
            TelemetryEvent::Progress { .. } | TelemetryEvent::Complete { .. }
        )
    }
}

/// Telemetry from one agent, tagged with the correlation id of the operation it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub agent_id: String,
    pub correlation_id: String,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

impl Telemetry {
    pub fn new(agent_id: &str, correlation_id: &str, event: TelemetryEvent) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            correlation_id: correlation_id.to_string(),
            event,
        }
    }
}

/// Telemetry frame as received on an agent socket; the agent id comes from the connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    pub correlation_id: String,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

impl TelemetryFrame {
    pub fn into_telemetry(self, agent_id: &str) -> Telemetry {
        Telemetry::new(agent_id, &self.correlation_id, self.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_frame() {
        let raw = r#"{"type":"telemetry","correlationId":"c-1","event":"progress","current":3,"total":10}"#;
        let frame: TelemetryFrame = serde_json::from_str(raw).unwrap();
        let telemetry = frame.into_telemetry("alice");
        assert_eq!(telemetry.agent_id, "alice");
        assert_eq!(telemetry.correlation_id, "c-1");
        assert_eq!(
            telemetry.event,
            TelemetryEvent::Progress { current: 3, total: 10 }
        );
    }

    #[test]
    fn test_interstitial_detection() {
        let blocked = TelemetryEvent::Error {
            code: "CAPTCHA".to_string(),
            message: "verify you are human".to_string(),
        };
        let generic = TelemetryEvent::Error {
            code: "timeout".to_string(),
            message: String::new(),
        };
        assert!(blocked.is_interstitial());
        assert!(!generic.is_interstitial());
        assert!(!blocked.confirms_start());
    }

    #[test]
    fn test_farm_begin_carries_correlation() {
        let cmd = AgentCommand::farm_begin(
            "corr",
            &FarmSettings {
                interval_minutes: 30,
                jitter_minutes: 5,
            },
        );
        assert_eq!(cmd.action, ACTION_FARM_BEGIN);
        assert_eq!(cmd.correlation_id.as_deref(), Some("corr"));
        assert_eq!(cmd.payload["intervalMinutes"], 30);
        assert_eq!(cmd.to_frame()["type"], "command");
    }
}
