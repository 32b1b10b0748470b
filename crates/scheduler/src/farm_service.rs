use chrono::Utc;
use farmhand_channels::AgentTransport;
use farmhand_core::{AgentCommand, Error, FarmConfig, FarmSettings, Reporter, Result, Telemetry, TelemetryEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::farm_session::{FarmSession, Progress, RunState, StartOutcome, TelemetryOutcome};

struct FarmEntry {
    session: FarmSession,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the pending timer is replaced; a timer that wakes with
    /// an old epoch does nothing.
    epoch: u64,
    /// Start of the current cycle or its latest matching telemetry.
    last_activity: Instant,
    last_telemetry_at: Option<Instant>,
}

impl FarmEntry {
    fn new(agent_id: &str, settings: FarmSettings) -> Self {
        Self {
            session: FarmSession::new(agent_id, settings),
            timer: None,
            epoch: 0,
            last_activity: Instant::now(),
            last_telemetry_at: None,
        }
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.epoch += 1;
        self.session.next_run_at = None;
    }
}

struct FarmState {
    entries: HashMap<String, FarmEntry>,
    rng: StdRng,
}

/// What a cycle needs once the lock is released.
struct CycleStart {
    correlation_id: String,
    settings: FarmSettings,
}

/// Per-agent farming loops.
///
/// Each agent cycles `Running -> Farming -> Running` on a jittered timer. The
/// remote operation is only observable through telemetry carrying the cycle's
/// correlation id; anything else is ignored. Silence is handled by the stall
/// watchdog and by [`FarmScheduler::reset_stalled`].
pub struct FarmScheduler {
    config: FarmConfig,
    transport: Arc<dyn AgentTransport>,
    reporter: Reporter,
    state: Mutex<FarmState>,
}

impl FarmScheduler {
    pub fn new(config: &FarmConfig, transport: Arc<dyn AgentTransport>, reporter: Reporter) -> Self {
        Self {
            config: config.clone(),
            transport,
            reporter,
            state: Mutex::new(FarmState {
                entries: HashMap::new(),
                rng: StdRng::from_entropy(),
            }),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.state.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn default_settings(&self) -> FarmSettings {
        FarmSettings::new(
            self.config.default_interval_minutes,
            self.config.default_jitter_minutes,
        )
    }

    /// Starts the loop for `agent_id` and runs the first cycle right away.
    ///
    /// Fails with [`Error::NotConnected`] when the agent has no master. A
    /// loop that is already started (in any state but `Idle`) is left alone.
    pub async fn start(self: &Arc<Self>, agent_id: &str, settings: Option<FarmSettings>) -> Result<StartOutcome> {
        let settings = settings.unwrap_or_else(|| self.default_settings());
        if settings.interval_minutes == 0 {
            return Err(Error::Validation(
                "intervalMinutes must be at least 1".to_string(),
            ));
        }
        if !self.transport.has_master(agent_id).await {
            warn!(agent_id = %agent_id, "Cannot start farming: no master session");
            return Err(Error::NotConnected(agent_id.to_string()));
        }

        let cycle = {
            let mut state = self.state.lock().await;
            let entry = state
                .entries
                .entry(agent_id.to_string())
                .or_insert_with(|| FarmEntry::new(agent_id, settings));
            if entry.session.run_state.is_started() {
                debug!(agent_id = %agent_id, state = %entry.session.run_state, "Farming already started");
                return Ok(StartOutcome::AlreadyRunning);
            }
            entry.session.settings = settings;
            entry.session.run_state = RunState::Running;
            entry.session.last_error = None;
            Self::begin_cycle(entry)
        };

        info!(
            agent_id = %agent_id,
            interval_minutes = settings.interval_minutes,
            jitter_minutes = settings.jitter_minutes,
            "Farming started"
        );
        self.reporter.agent(
            agent_id,
            "farm_started",
            format!(
                "Farming every {}±{} min",
                settings.interval_minutes, settings.jitter_minutes
            ),
            json!({ "settings": settings }),
        );
        self.dispatch_cycle(agent_id, cycle).await;
        Ok(StartOutcome::Started)
    }

    pub async fn stop(&self, agent_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let entry = state
                .entries
                .get_mut(agent_id)
                .ok_or_else(|| Error::NotFound(format!("farm session for {}", agent_id)))?;
            entry.disarm();
            entry.session.run_state = RunState::Idle;
            entry.session.current_correlation_id = None;
            entry.session.progress = None;
        }
        self.send_halt(agent_id).await;
        info!(agent_id = %agent_id, "Farming stopped");
        self.reporter
            .agent(agent_id, "farm_stopped", "Farming stopped", serde_json::Value::Null);
        Ok(())
    }

    pub async fn pause(&self, agent_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let entry = state
                .entries
                .get_mut(agent_id)
                .ok_or_else(|| Error::NotFound(format!("farm session for {}", agent_id)))?;
            match entry.session.run_state {
                RunState::Idle => {
                    return Err(Error::InvalidState(format!("farming is not running for {}", agent_id)))
                }
                RunState::Paused => return Ok(()),
                _ => {}
            }
            entry.disarm();
            entry.session.run_state = RunState::Paused;
        }
        self.send_halt(agent_id).await;
        info!(agent_id = %agent_id, "Farming paused");
        self.reporter
            .agent(agent_id, "farm_paused", "Farming paused", json!({ "manual": true }));
        Ok(())
    }

    /// Leaves `Paused` and runs a cycle immediately.
    pub async fn resume(self: &Arc<Self>, agent_id: &str) -> Result<()> {
        let cycle = {
            let mut state = self.state.lock().await;
            let entry = state
                .entries
                .get_mut(agent_id)
                .ok_or_else(|| Error::NotFound(format!("farm session for {}", agent_id)))?;
            match entry.session.run_state {
                RunState::Paused => {}
                RunState::Idle => {
                    return Err(Error::InvalidState(format!("farming is not running for {}", agent_id)))
                }
                _ => return Ok(()),
            }
            entry.session.run_state = RunState::Running;
            entry.session.last_error = None;
            Self::begin_cycle(entry)
        };
        info!(agent_id = %agent_id, "Farming resumed");
        self.reporter
            .agent(agent_id, "farm_resumed", "Farming resumed", serde_json::Value::Null);
        self.dispatch_cycle(agent_id, cycle).await;
        Ok(())
    }

    /// Abandons a cycle believed hung and arms the short retry.
    pub async fn reset_stalled(self: &Arc<Self>, agent_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(agent_id)
            .ok_or_else(|| Error::NotFound(format!("farm session for {}", agent_id)))?;
        if !entry.session.run_state.is_in_cycle() {
            debug!(agent_id = %agent_id, state = %entry.session.run_state, "Nothing to reset");
            return Ok(());
        }
        entry.session.run_state = RunState::Running;
        entry.session.last_error = Some("cycle stalled".to_string());
        let delay = self.config.retry_delay();
        self.arm_timer(agent_id, entry, delay);
        warn!(agent_id = %agent_id, retry_secs = delay.as_secs(), "Stalled cycle reset");
        self.reporter.agent(
            agent_id,
            "farm_reset",
            format!("Stalled cycle reset, retrying in {}s", delay.as_secs()),
            json!({ "retrySecs": delay.as_secs() }),
        );
        Ok(())
    }

    pub async fn handle_telemetry(self: &Arc<Self>, telemetry: &Telemetry) -> TelemetryOutcome {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let agent_id = telemetry.agent_id.as_str();
        let Some(entry) = state.entries.get_mut(agent_id) else {
            return TelemetryOutcome::Ignored;
        };
        if entry.session.current_correlation_id.as_deref() != Some(telemetry.correlation_id.as_str())
            || !entry.session.run_state.is_in_cycle()
        {
            debug!(
                agent_id = %agent_id,
                correlation_id = %telemetry.correlation_id,
                state = %entry.session.run_state,
                "Ignoring telemetry for another cycle"
            );
            return TelemetryOutcome::Ignored;
        }

        let now = Instant::now();
        entry.last_activity = now;
        entry.last_telemetry_at = Some(now);

        match &telemetry.event {
            TelemetryEvent::Progress { current, total } => {
                entry.session.progress = Some(Progress {
                    current: *current,
                    total: *total,
                });
                if entry.session.run_state == RunState::Stalled {
                    entry.disarm();
                    entry.session.run_state = RunState::Farming;
                    entry.session.last_error = None;
                    info!(agent_id = %agent_id, "Stalled cycle revived by progress");
                }
                self.reporter.agent(
                    agent_id,
                    "farm_progress",
                    format!("{}/{}", current, total),
                    json!({ "current": current, "total": total }),
                );
            }
            TelemetryEvent::Complete { stats } => {
                entry.session.run_state = RunState::Running;
                entry.session.cycles_completed += 1;
                entry.session.last_completed_at = Some(Utc::now());
                entry.session.last_stats = stats.clone();
                entry.session.last_error = None;
                let delay = next_run_delay(&mut state.rng, &entry.session.settings, self.config.min_run_delay());
                self.arm_timer(agent_id, entry, delay);
                info!(
                    agent_id = %agent_id,
                    cycles = entry.session.cycles_completed,
                    next_run_secs = delay.as_secs(),
                    "Farming cycle complete"
                );
                self.reporter.agent(
                    agent_id,
                    "farm_complete",
                    format!("Cycle complete, next run in {}s", delay.as_secs()),
                    json!({
                        "stats": stats,
                        "cyclesCompleted": entry.session.cycles_completed,
                        "nextRunAt": entry.session.next_run_at,
                    }),
                );
            }
            TelemetryEvent::Error { code, message } => {
                let text = if message.is_empty() {
                    code.clone()
                } else {
                    format!("{}: {}", code, message)
                };
                entry.session.last_error = Some(text.clone());
                if telemetry.event.is_interstitial() {
                    entry.disarm();
                    entry.session.run_state = RunState::Paused;
                    warn!(agent_id = %agent_id, code = %code, "Bot protection detected, farming paused");
                    self.reporter.agent(
                        agent_id,
                        "farm_paused",
                        format!("Paused on bot protection: {}", text),
                        json!({ "code": code, "manual": false }),
                    );
                } else {
                    entry.session.run_state = RunState::Running;
                    let delay = self.config.retry_delay();
                    self.arm_timer(agent_id, entry, delay);
                    warn!(agent_id = %agent_id, error = %text, retry_secs = delay.as_secs(), "Farming cycle failed");
                    self.reporter.agent(
                        agent_id,
                        "farm_error",
                        format!("{}, retrying in {}s", text, delay.as_secs()),
                        json!({ "code": code, "message": message, "retrySecs": delay.as_secs() }),
                    );
                }
            }
        }
        TelemetryOutcome::Accepted
    }

    /// Marks silent `Farming` cycles as `Stalled` and arms their retry.
    /// Returns the affected agent ids.
    pub async fn check_stalls(self: &Arc<Self>) -> Vec<String> {
        let timeout = self.config.stall_timeout();
        let retry = self.config.retry_delay();
        let now = Instant::now();
        let mut stalled = Vec::new();

        let mut state = self.state.lock().await;
        for (agent_id, entry) in state.entries.iter_mut() {
            if entry.session.run_state != RunState::Farming
                || now.saturating_duration_since(entry.last_activity) < timeout
            {
                continue;
            }
            entry.session.run_state = RunState::Stalled;
            entry.session.last_error = Some(format!("no telemetry for {}s", timeout.as_secs()));
            self.arm_timer(agent_id, entry, retry);
            warn!(agent_id = %agent_id, retry_secs = retry.as_secs(), "Farming cycle stalled");
            self.reporter.agent(
                agent_id,
                "farm_stalled",
                format!("No telemetry for {}s, retrying in {}s", timeout.as_secs(), retry.as_secs()),
                json!({ "retrySecs": retry.as_secs() }),
            );
            stalled.push(agent_id.clone());
        }
        stalled.sort();
        stalled
    }

    pub async fn get(&self, agent_id: &str) -> Option<FarmSession> {
        let state = self.state.lock().await;
        state.entries.get(agent_id).map(|e| e.session.clone())
    }

    pub async fn list(&self) -> Vec<FarmSession> {
        let state = self.state.lock().await;
        let mut sessions: Vec<FarmSession> = state.entries.values().map(|e| e.session.clone()).collect();
        sessions.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        sessions
    }

    /// A cycle is in flight and the agent has reported progress for it.
    pub async fn is_actively_farming(&self, agent_id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .entries
            .get(agent_id)
            .map(|e| e.session.run_state == RunState::Farming && e.session.progress.is_some())
            .unwrap_or(false)
    }

    /// When the last telemetry matching a live cycle was accepted.
    pub async fn last_telemetry_at(&self, agent_id: &str) -> Option<Instant> {
        let state = self.state.lock().await;
        state.entries.get(agent_id).and_then(|e| e.last_telemetry_at)
    }

    fn begin_cycle(entry: &mut FarmEntry) -> CycleStart {
        entry.disarm();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        entry.session.run_state = RunState::Farming;
        entry.session.current_correlation_id = Some(correlation_id.clone());
        entry.session.progress = None;
        entry.last_activity = Instant::now();
        CycleStart {
            correlation_id,
            settings: entry.session.settings,
        }
    }

    async fn dispatch_cycle(self: &Arc<Self>, agent_id: &str, cycle: CycleStart) {
        let command = AgentCommand::farm_begin(&cycle.correlation_id, &cycle.settings);
        if self.transport.send(agent_id, &command).await {
            debug!(agent_id = %agent_id, correlation_id = %cycle.correlation_id, "Farming cycle dispatched");
            self.reporter.agent(
                agent_id,
                "farm_cycle_started",
                "Farming cycle started",
                json!({ "correlationId": cycle.correlation_id }),
            );
            return;
        }

        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(agent_id) else {
            return;
        };
        if entry.session.current_correlation_id.as_deref() != Some(cycle.correlation_id.as_str())
            || !entry.session.run_state.is_in_cycle()
        {
            return;
        }
        entry.session.run_state = RunState::Running;
        entry.session.last_error = Some("agent not connected".to_string());
        let delay = self.config.retry_delay();
        self.arm_timer(agent_id, entry, delay);
        warn!(agent_id = %agent_id, retry_secs = delay.as_secs(), "Farming cycle not delivered");
        self.reporter.agent(
            agent_id,
            "farm_error",
            format!("Agent not connected, retrying in {}s", delay.as_secs()),
            json!({ "code": "not_connected", "retrySecs": delay.as_secs() }),
        );
    }

    async fn send_halt(&self, agent_id: &str) {
        if !self.transport.send(agent_id, &AgentCommand::farm_halt()).await {
            debug!(agent_id = %agent_id, "Halt not delivered");
        }
    }

    fn arm_timer(self: &Arc<Self>, agent_id: &str, entry: &mut FarmEntry, delay: Duration) {
        entry.disarm();
        let epoch = entry.epoch;
        entry.session.next_run_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));

        let this = Arc::clone(self);
        let agent_id = agent_id.to_string();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.on_timer(&agent_id, epoch).await;
        }));
    }

    async fn on_timer(self: &Arc<Self>, agent_id: &str, epoch: u64) {
        let cycle = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.entries.get_mut(agent_id) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            // This task owns the handle; detach it so starting the cycle does not abort us.
            entry.timer = None;
            match entry.session.run_state {
                RunState::Running | RunState::Stalled => Self::begin_cycle(entry),
                _ => return,
            }
        };
        self.dispatch_cycle(agent_id, cycle).await;
    }
}

/// `interval ± jitter`, uniform, never below `floor`.
fn next_run_delay(rng: &mut StdRng, settings: &FarmSettings, floor: Duration) -> Duration {
    let base = i64::from(settings.interval_minutes) * 60;
    let jitter = i64::from(settings.jitter_minutes) * 60;
    let offset = if jitter > 0 { rng.gen_range(-jitter..=jitter) } else { 0 };
    Duration::from_secs((base + offset).max(0) as u64).max(floor)
}
