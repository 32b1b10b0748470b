use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farmhand_core::{AgentCommand, Error, Reporter, Result, SessionRole};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::transport::AgentTransport;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Connected,
    Disconnected,
}

struct Session {
    session_id: String,
    role: SessionRole,
    connected_at: DateTime<Utc>,
    /// Monotonic connect order, used to pick the newest standby on failover.
    seq: u64,
    was_master_hint: bool,
    handle: ConnectionHandle,
}

struct AgentEntry {
    status: AgentStatus,
    last_seen: DateTime<Utc>,
    sessions: Vec<Session>,
}

impl AgentEntry {
    fn master(&self) -> Option<&Session> {
        self.sessions.iter().find(|s| s.role == SessionRole::Master)
    }

    /// Standby that should take over: hinted sessions first, then most recently connected.
    fn replacement_index(&self) -> Option<usize> {
        self.sessions
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| (s.was_master_hint, s.seq))
            .map(|(i, _)| i)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub role: SessionRole,
    pub connected_at: DateTime<Utc>,
    pub was_master_hint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub agent_id: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    pub master_session_id: Option<String>,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub session_id: String,
    pub is_master: bool,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentEntry>,
    next_seq: u64,
}

/// Tracks every live connection per agent and which one is master.
///
/// At most one session per agent holds [`SessionRole::Master`]. Role changes
/// are explicit transitions, and every session whose role changes is told so
/// through its own connection.
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    reporter: Reporter,
}

impl SessionRegistry {
    pub fn new(reporter: Reporter) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            reporter,
        }
    }

    /// Adds a session. It becomes master only if the agent has no live master.
    pub async fn register(
        &self,
        agent_id: &str,
        handle: ConnectionHandle,
        was_master_hint: bool,
    ) -> Registration {
        let session_id = uuid::Uuid::new_v4().to_string();
        let role = {
            let mut state = self.state.lock().await;
            state.next_seq += 1;
            let seq = state.next_seq;
            let now = Utc::now();
            let entry = state
                .agents
                .entry(agent_id.to_string())
                .or_insert_with(|| AgentEntry {
                    status: AgentStatus::Connected,
                    last_seen: now,
                    sessions: Vec::new(),
                });

            let role = if entry.master().is_some() {
                SessionRole::Standby
            } else {
                SessionRole::Master
            };
            entry.status = AgentStatus::Connected;
            entry.last_seen = now;
            entry.sessions.push(Session {
                session_id: session_id.clone(),
                role,
                connected_at: now,
                seq,
                was_master_hint,
                handle: handle.clone(),
            });
            role
        };

        info!(agent_id = %agent_id, session_id = %session_id, role = %role, "Session registered");
        notify_role(&handle, agent_id, &session_id, role).await;
        self.reporter.agent(
            agent_id,
            "session_registered",
            format!("session {} connected as {}", session_id, role),
            json!({ "sessionId": session_id, "role": role, "wasMasterHint": was_master_hint }),
        );

        Registration {
            is_master: role == SessionRole::Master,
            session_id,
        }
    }

    /// Makes `session_id` the master, demoting the previous master to standby.
    pub async fn promote(&self, agent_id: &str, session_id: &str) -> Result<()> {
        let not_found = || Error::SessionNotFound {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
        };

        let (promoted, demoted) = {
            let mut state = self.state.lock().await;
            let entry = state.agents.get_mut(agent_id).ok_or_else(not_found)?;
            let target = entry
                .sessions
                .iter()
                .position(|s| s.session_id == session_id)
                .ok_or_else(not_found)?;

            if entry.sessions[target].role == SessionRole::Master {
                debug!(agent_id = %agent_id, session_id = %session_id, "Session already master");
                return Ok(());
            }

            let mut demoted = None;
            for session in entry.sessions.iter_mut() {
                if session.role == SessionRole::Master {
                    session.role = SessionRole::Standby;
                    demoted = Some((session.session_id.clone(), session.handle.clone()));
                }
            }
            let target = &mut entry.sessions[target];
            target.role = SessionRole::Master;
            (target.handle.clone(), demoted)
        };

        notify_role(&promoted, agent_id, session_id, SessionRole::Master).await;
        if let Some((demoted_id, handle)) = &demoted {
            notify_role(handle, agent_id, demoted_id, SessionRole::Standby).await;
        }

        info!(agent_id = %agent_id, session_id = %session_id, "Session promoted to master");
        self.reporter.agent(
            agent_id,
            "session_promoted",
            format!("session {} promoted to master", session_id),
            json!({
                "sessionId": session_id,
                "demotedSessionId": demoted.map(|(id, _)| id),
            }),
        );
        Ok(())
    }

    /// Removes a session. Returns the id of the session promoted in its place, if any.
    pub async fn disconnect(&self, agent_id: &str, session_id: &str) -> Option<String> {
        let (was_master, promoted, remaining) = {
            let mut state = self.state.lock().await;
            let entry = state.agents.get_mut(agent_id)?;
            let idx = entry
                .sessions
                .iter()
                .position(|s| s.session_id == session_id)?;
            let removed = entry.sessions.remove(idx);
            entry.last_seen = Utc::now();

            let was_master = removed.role == SessionRole::Master;
            let mut promoted = None;
            if was_master {
                if let Some(i) = entry.replacement_index() {
                    let next = &mut entry.sessions[i];
                    next.role = SessionRole::Master;
                    promoted = Some((next.session_id.clone(), next.handle.clone()));
                }
            }
            if entry.sessions.is_empty() {
                entry.status = AgentStatus::Disconnected;
            }
            (was_master, promoted, entry.sessions.len())
        };

        info!(
            agent_id = %agent_id,
            session_id = %session_id,
            was_master,
            remaining,
            "Session disconnected"
        );

        if let Some((new_id, handle)) = &promoted {
            notify_role(handle, agent_id, new_id, SessionRole::Master).await;
            info!(agent_id = %agent_id, session_id = %new_id, "Standby promoted after master disconnect");
        } else if was_master {
            warn!(agent_id = %agent_id, "Agent has no master until a session reconnects");
        }

        self.reporter.agent(
            agent_id,
            "session_disconnected",
            format!("session {} disconnected", session_id),
            json!({
                "sessionId": session_id,
                "wasMaster": was_master,
                "promotedSessionId": promoted.as_ref().map(|(id, _)| id.clone()),
                "remainingSessions": remaining,
            }),
        );

        promoted.map(|(id, _)| id)
    }

    pub async fn master_connection(&self, agent_id: &str) -> Option<ConnectionHandle> {
        let state = self.state.lock().await;
        state
            .agents
            .get(agent_id)
            .and_then(|e| e.master())
            .map(|s| s.handle.clone())
    }

    pub async fn master_session_id(&self, agent_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .agents
            .get(agent_id)
            .and_then(|e| e.master())
            .map(|s| s.session_id.clone())
    }

    /// Refreshes `last_seen` for an agent that just sent something.
    pub async fn touch(&self, agent_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.agents.get_mut(agent_id) {
            entry.last_seen = Utc::now();
        }
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentInfo> {
        let state = self.state.lock().await;
        state.agents.get(agent_id).map(|e| agent_info(agent_id, e))
    }

    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let state = self.state.lock().await;
        let mut agents: Vec<AgentInfo> = state
            .agents
            .iter()
            .map(|(id, e)| agent_info(id, e))
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }
}

#[async_trait]
impl AgentTransport for SessionRegistry {
    async fn send(&self, agent_id: &str, command: &AgentCommand) -> bool {
        let Some(handle) = self.master_connection(agent_id).await else {
            debug!(agent_id = %agent_id, action = %command.action, "No master session, command not sent");
            return false;
        };
        match handle.send(command).await {
            Ok(()) => true,
            Err(e) => {
                warn!(agent_id = %agent_id, action = %command.action, error = %e, "Failed to send command to master");
                false
            }
        }
    }

    async fn has_master(&self, agent_id: &str) -> bool {
        self.master_connection(agent_id).await.is_some()
    }
}

fn agent_info(agent_id: &str, entry: &AgentEntry) -> AgentInfo {
    AgentInfo {
        agent_id: agent_id.to_string(),
        status: entry.status,
        last_seen: entry.last_seen,
        master_session_id: entry.master().map(|s| s.session_id.clone()),
        sessions: entry
            .sessions
            .iter()
            .map(|s| SessionInfo {
                session_id: s.session_id.clone(),
                role: s.role,
                connected_at: s.connected_at,
                was_master_hint: s.was_master_hint,
            })
            .collect(),
    }
}

async fn notify_role(handle: &ConnectionHandle, agent_id: &str, session_id: &str, role: SessionRole) {
    if let Err(e) = handle
        .send(&AgentCommand::session_role(session_id, role))
        .await
    {
        warn!(agent_id = %agent_id, session_id = %session_id, error = %e, "Failed to notify session of its role");
    }
}
