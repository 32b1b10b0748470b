use chrono::{DateTime, Utc};
use farmhand_channels::AgentTransport;
use farmhand_core::config::ordered;
use farmhand_core::{BulkConfig, Error, FarmSettings, Reporter, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::farm_service::FarmScheduler;
use crate::farm_session::{RunState, StartOutcome};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BulkStatus {
    Running,
    Complete,
    Stopped,
}

/// Per-call overrides; anything left out falls back to the `bulk` config section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOptions {
    #[serde(default)]
    pub stagger_min_secs: Option<u64>,
    #[serde(default)]
    pub stagger_max_secs: Option<u64>,
    #[serde(default)]
    pub randomize_min_minutes: Option<u32>,
    #[serde(default)]
    pub randomize_max_minutes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartedAgent {
    pub agent_id: String,
    pub settings: FarmSettings,
    pub confirmed: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentFailure {
    pub agent_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOperation {
    pub id: String,
    pub status: BulkStatus,
    pub base_settings: FarmSettings,
    /// Seconds between successive starts.
    pub stagger_range: (u64, u64),
    /// Magnitude, in minutes, of the offset applied to each agent's settings.
    pub randomize_range: (u32, u32),
    pub pending: VecDeque<String>,
    pub started: Vec<StartedAgent>,
    pub failed: Vec<AgentFailure>,
    pub skipped: Vec<AgentFailure>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BulkOperation {
    fn progress(&self) -> serde_json::Value {
        json!({
            "operationId": self.id,
            "started": self.started.len(),
            "failed": self.failed.len(),
            "skipped": self.skipped.len(),
            "pending": self.pending.len(),
        })
    }
}

struct BulkState {
    operation: Option<BulkOperation>,
    /// Bumped on every start and stop; timers from an older epoch do nothing.
    epoch: u64,
    stagger_timer: Option<JoinHandle<()>>,
    /// Outstanding confirmation timers with the instant each agent was started.
    confirm_timers: HashMap<String, (JoinHandle<()>, Instant)>,
    rng: StdRng,
}

impl BulkState {
    fn cancel_timers(&mut self) {
        if let Some(timer) = self.stagger_timer.take() {
            timer.abort();
        }
        for (_, (timer, _)) in self.confirm_timers.drain() {
            timer.abort();
        }
    }
}

/// Fleet-wide staggered rollout of farming loops. One operation runs at a time.
pub struct BulkOrchestrator {
    config: BulkConfig,
    farm: Arc<FarmScheduler>,
    transport: Arc<dyn AgentTransport>,
    reporter: Reporter,
    state: Mutex<BulkState>,
}

impl BulkOrchestrator {
    pub fn new(
        config: &BulkConfig,
        farm: Arc<FarmScheduler>,
        transport: Arc<dyn AgentTransport>,
        reporter: Reporter,
    ) -> Self {
        Self {
            config: config.clone(),
            farm,
            transport,
            reporter,
            state: Mutex::new(BulkState {
                operation: None,
                epoch: 0,
                stagger_timer: None,
                confirm_timers: HashMap::new(),
                rng: StdRng::from_entropy(),
            }),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.state.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Begins a rollout over `agent_ids` and returns its id.
    ///
    /// Agents without a master are skipped up front. Rejected with
    /// [`Error::AlreadyRunning`] while another operation is running, in which
    /// case nothing changes.
    pub async fn start(
        self: &Arc<Self>,
        agent_ids: &[String],
        base_settings: Option<FarmSettings>,
        options: BulkOptions,
    ) -> Result<String> {
        let base = base_settings.unwrap_or_else(|| self.farm.default_settings());
        if base.interval_minutes == 0 {
            return Err(Error::Validation("intervalMinutes must be at least 1".to_string()));
        }
        if agent_ids.is_empty() {
            return Err(Error::Validation("no agents given".to_string()));
        }

        let stagger_range = ordered(
            options.stagger_min_secs.unwrap_or(self.config.stagger_min_secs),
            options.stagger_max_secs.unwrap_or(self.config.stagger_max_secs),
        );
        let randomize_range = ordered(
            options
                .randomize_min_minutes
                .unwrap_or(self.config.randomize_min_minutes),
            options
                .randomize_max_minutes
                .unwrap_or(self.config.randomize_max_minutes),
        );

        let mut state = self.state.lock().await;
        if let Some(op) = state.operation.as_ref().filter(|op| op.status == BulkStatus::Running) {
            return Err(Error::AlreadyRunning(format!("bulk operation {}", op.id)));
        }

        let mut seen = HashSet::new();
        let mut pending = VecDeque::new();
        let mut skipped = Vec::new();
        for agent_id in agent_ids {
            if !seen.insert(agent_id.as_str()) {
                continue;
            }
            if self.transport.has_master(agent_id).await {
                pending.push_back(agent_id.clone());
            } else {
                skipped.push(AgentFailure {
                    agent_id: agent_id.clone(),
                    reason: "not connected".to_string(),
                });
            }
        }

        state.cancel_timers();
        state.epoch += 1;
        let epoch = state.epoch;
        let mut operation = BulkOperation {
            id: uuid::Uuid::new_v4().to_string(),
            status: BulkStatus::Running,
            base_settings: base,
            stagger_range,
            randomize_range,
            pending,
            started: Vec::new(),
            failed: Vec::new(),
            skipped,
            created_at: Utc::now(),
            finished_at: None,
        };
        let id = operation.id.clone();

        info!(
            operation_id = %id,
            pending = operation.pending.len(),
            skipped = operation.skipped.len(),
            "Bulk start"
        );
        self.reporter.system(
            "bulk_started",
            format!(
                "Bulk start of {} agents ({} skipped)",
                operation.pending.len(),
                operation.skipped.len()
            ),
            operation.progress(),
        );
        if operation.pending.is_empty() {
            self.finish(&mut operation);
            state.operation = Some(operation);
            return Ok(id);
        }
        state.operation = Some(operation);
        self.schedule_next(&mut state, Duration::ZERO, epoch);
        Ok(id)
    }

    /// Cancels the stagger and every confirmation timer. Pending agents are
    /// dropped untouched; `started` and `failed` keep their current contents.
    pub async fn stop(&self) -> Result<BulkOperation> {
        let mut state = self.state.lock().await;
        state.cancel_timers();
        state.epoch += 1;
        let op = state
            .operation
            .as_mut()
            .ok_or_else(|| Error::NotFound("bulk operation".to_string()))?;
        if op.status == BulkStatus::Running {
            op.status = BulkStatus::Stopped;
            op.finished_at = Some(Utc::now());
        }
        let dropped = op.pending.len();
        op.pending.clear();

        info!(operation_id = %op.id, dropped, "Bulk operation stopped");
        self.reporter.system(
            "bulk_stopped",
            format!("Bulk operation stopped, {} agents not started", dropped),
            op.progress(),
        );
        Ok(op.clone())
    }

    /// [`stop`](Self::stop), then stops the farming loop of every started agent.
    pub async fn stop_all_farms(&self) -> Result<BulkOperation> {
        let op = self.stop().await?;
        for agent in &op.started {
            if let Err(e) = self.farm.stop(&agent.agent_id).await {
                warn!(agent_id = %agent.agent_id, error = %e, "Failed to stop farming");
            }
        }
        self.reporter.system(
            "bulk_farms_stopped",
            format!("Stopped farming on {} agents", op.started.len()),
            json!({ "operationId": op.id, "agents": op.started.len() }),
        );
        Ok(op)
    }

    pub async fn status(&self) -> Option<BulkOperation> {
        self.state.lock().await.operation.clone()
    }

    /// Confirms a started agent on start-proving telemetry. Returns whether
    /// an outstanding confirmation was settled.
    pub async fn on_telemetry(&self, agent_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some((timer, _)) = state.confirm_timers.remove(agent_id) else {
            return false;
        };
        timer.abort();
        Self::confirm(&mut state, agent_id);
        debug!(agent_id = %agent_id, "Bulk start confirmed");
        self.reporter.agent(
            agent_id,
            "bulk_confirmed",
            "Start confirmed by telemetry",
            serde_json::Value::Null,
        );
        true
    }

    fn confirm(state: &mut BulkState, agent_id: &str) {
        if let Some(op) = state.operation.as_mut() {
            if let Some(entry) = op.started.iter_mut().find(|s| s.agent_id == agent_id) {
                entry.confirmed = true;
            }
        }
    }

    fn schedule_next(self: &Arc<Self>, state: &mut BulkState, delay: Duration, epoch: u64) {
        let this = Arc::clone(self);
        state.stagger_timer = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            this.process_next(epoch).await;
        }));
    }

    fn arm_confirmation(self: &Arc<Self>, state: &mut BulkState, agent_id: &str, epoch: u64) {
        let this = Arc::clone(self);
        let delay = self.config.confirm_timeout();
        let agent = agent_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.on_confirm_timeout(&agent, epoch).await;
        });
        if let Some((old, _)) = state
            .confirm_timers
            .insert(agent_id.to_string(), (timer, Instant::now()))
        {
            old.abort();
        }
    }

    async fn process_next(self: &Arc<Self>, epoch: u64) {
        let (agent_id, settings) = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch {
                return;
            }
            // This task owns the stagger handle; detach it.
            state.stagger_timer = None;

            let Some(op) = state.operation.as_mut().filter(|op| op.status == BulkStatus::Running) else {
                return;
            };
            let Some(agent_id) = op.pending.pop_front() else {
                self.finish(op);
                return;
            };
            let base = op.base_settings;
            let randomize_range = op.randomize_range;
            let settings = self.randomize(&mut state.rng, base, randomize_range);
            (agent_id, settings)
        };

        // No bulk lock across the start: it may wait on the agent's socket.
        let result = self.farm.start(&agent_id, Some(settings)).await;
        let already = match result {
            Ok(StartOutcome::AlreadyRunning) => self.farm.get(&agent_id).await.map(|s| s.run_state),
            _ => None,
        };

        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            debug!(agent_id = %agent_id, "Bulk operation replaced while starting agent");
            return;
        }
        let Some(op) = state.operation.as_mut().filter(|op| op.status == BulkStatus::Running) else {
            debug!(agent_id = %agent_id, "Bulk operation stopped while starting agent");
            return;
        };
        let armed = match (result, already) {
            (Ok(_), Some(run_state)) if run_state != RunState::Farming => {
                let reason = format!("already {}", run_state);
                info!(agent_id = %agent_id, state = %run_state, "Bulk skipped agent with a live farming loop");
                self.reporter.agent(
                    &agent_id,
                    "bulk_agent_skipped",
                    format!("Skipped: {}", reason),
                    json!({ "reason": reason }),
                );
                op.skipped.push(AgentFailure {
                    agent_id: agent_id.clone(),
                    reason,
                });
                false
            }
            (Ok(_), _) => {
                op.started.push(StartedAgent {
                    agent_id: agent_id.clone(),
                    settings,
                    confirmed: false,
                    started_at: Utc::now(),
                });
                info!(agent_id = %agent_id, interval = settings.interval_minutes, jitter = settings.jitter_minutes, "Bulk started agent");
                self.reporter.agent(
                    &agent_id,
                    "bulk_agent_started",
                    format!("Started ({}±{} min)", settings.interval_minutes, settings.jitter_minutes),
                    json!({ "settings": settings }),
                );
                true
            }
            (Err(e), _) => {
                op.failed.push(AgentFailure {
                    agent_id: agent_id.clone(),
                    reason: e.to_string(),
                });
                warn!(agent_id = %agent_id, error = %e, "Bulk start failed for agent");
                self.reporter.agent(
                    &agent_id,
                    "bulk_agent_failed",
                    format!("Start failed: {}", e),
                    json!({ "reason": e.to_string() }),
                );
                false
            }
        };

        self.reporter.system(
            "bulk_progress",
            format!(
                "{} started, {} failed, {} pending",
                op.started.len(),
                op.failed.len(),
                op.pending.len()
            ),
            op.progress(),
        );

        let more = !op.pending.is_empty();
        let stagger_range = op.stagger_range;
        if !more {
            self.finish(op);
        }

        if armed {
            self.arm_confirmation(&mut state, &agent_id, epoch);
        }
        if more {
            let stagger = draw_duration(&mut state.rng, stagger_range);
            debug!(stagger_ms = stagger.as_millis() as u64, "Waiting before next bulk start");
            self.schedule_next(&mut state, stagger, epoch);
        }
    }

    fn finish(&self, op: &mut BulkOperation) {
        op.status = BulkStatus::Complete;
        op.finished_at = Some(Utc::now());
        info!(operation_id = %op.id, started = op.started.len(), failed = op.failed.len(), "Bulk operation complete");
        self.reporter
            .system("bulk_complete", "Bulk operation complete", op.progress());
    }

    async fn on_confirm_timeout(self: &Arc<Self>, agent_id: &str, epoch: u64) {
        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            return;
        }
        let Some((_, started_at)) = state.confirm_timers.remove(agent_id) else {
            return;
        };

        // Telemetry that reached the scheduler but not us yet still counts.
        let heard = self
            .farm
            .last_telemetry_at(agent_id)
            .await
            .map_or(false, |at| at >= started_at);
        if heard || self.farm.is_actively_farming(agent_id).await {
            Self::confirm(&mut state, agent_id);
            info!(agent_id = %agent_id, "Bulk start confirmed late");
            self.reporter.agent(
                agent_id,
                "bulk_confirmed",
                "Start confirmed after deadline",
                json!({ "late": true }),
            );
            return;
        }

        let Some(op) = state.operation.as_mut() else {
            return;
        };
        let Some(pos) = op
            .started
            .iter()
            .position(|s| s.agent_id == agent_id && !s.confirmed)
        else {
            return;
        };
        op.started.remove(pos);
        op.failed.push(AgentFailure {
            agent_id: agent_id.to_string(),
            reason: "confirmation timeout".to_string(),
        });
        warn!(agent_id = %agent_id, "No telemetry before the confirmation deadline");
        self.reporter.agent(
            agent_id,
            "bulk_agent_failed",
            "Confirmation timeout, farming loop will retry",
            json!({ "reason": "confirmation timeout" }),
        );
        self.reporter.system("bulk_progress", "Confirmation timeout", op.progress());
        drop(state);

        if let Err(e) = self.farm.reset_stalled(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to reset stalled cycle");
        }
    }

    /// Applies an independent signed offset to interval and jitter, floored by config.
    fn randomize(&self, rng: &mut StdRng, base: FarmSettings, (lo, hi): (u32, u32)) -> FarmSettings {
        let mut shift = |value: u32| -> i64 {
            let magnitude = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
            let signed = if rng.gen_bool(0.5) {
                i64::from(magnitude)
            } else {
                -i64::from(magnitude)
            };
            i64::from(value) + signed
        };
        let interval = shift(base.interval_minutes).max(i64::from(self.config.min_interval_minutes.max(1)));
        let jitter = shift(base.jitter_minutes).max(i64::from(self.config.min_jitter_minutes));
        FarmSettings::new(clamp_u32(interval), clamp_u32(jitter))
    }
}

fn clamp_u32(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

fn draw_duration(rng: &mut StdRng, (lo, hi): (u64, u64)) -> Duration {
    let lo_ms = lo.saturating_mul(1000);
    let hi_ms = hi.saturating_mul(1000);
    if hi_ms > lo_ms {
        Duration::from_millis(rng.gen_range(lo_ms..=hi_ms))
    } else {
        Duration::from_millis(lo_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::farm_session::TelemetryOutcome;
    use crate::testing::FakeTransport;
    use farmhand_core::{FarmConfig, Telemetry, TelemetryEvent};

    struct Fixture {
        transport: Arc<FakeTransport>,
        farm: Arc<FarmScheduler>,
        bulk: Arc<BulkOrchestrator>,
    }

    fn fixture(agents: &[&str]) -> Fixture {
        let transport = FakeTransport::new(agents);
        let farm_config = FarmConfig {
            retry_delay_secs: 120,
            ..FarmConfig::default()
        };
        let farm = Arc::new(
            FarmScheduler::new(&farm_config, transport.clone(), Reporter::disabled()).with_seed(1),
        );
        let bulk_config = BulkConfig {
            confirm_timeout_secs: 30,
            stagger_min_secs: 1,
            stagger_max_secs: 2,
            ..BulkConfig::default()
        };
        let bulk = Arc::new(
            BulkOrchestrator::new(&bulk_config, farm.clone(), transport.clone(), Reporter::disabled())
                .with_seed(2),
        );
        Fixture { transport, farm, bulk }
    }

    fn ids(agents: &[&str]) -> Vec<String> {
        agents.iter().map(|a| a.to_string()).collect()
    }

    async fn advance_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn confirm_with_progress(f: &Fixture, agent: &str) {
        let corr = f.transport.begins(agent).last().cloned().unwrap();
        let telemetry = Telemetry::new(agent, &corr, TelemetryEvent::Progress { current: 1, total: 5 });
        assert_eq!(f.farm.handle_telemetry(&telemetry).await, TelemetryOutcome::Accepted);
        f.bulk.on_telemetry(agent).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_structural_failure_mid_rollout() {
        let f = fixture(&["a", "b", "c"]);
        f.bulk.start(&ids(&["a", "b", "c"]), None, BulkOptions::default()).await.unwrap();

        advance_ms(10).await;
        assert_eq!(f.transport.begins("a").len(), 1);
        // "b" loses its master between validation and its turn.
        f.transport.disconnect("b");

        advance_ms(5_000).await;
        let op = f.bulk.status().await.unwrap();
        assert_eq!(op.status, BulkStatus::Complete);
        assert!(op.pending.is_empty());
        let started: Vec<&str> = op.started.iter().map(|s| s.agent_id.as_str()).collect();
        assert_eq!(started, vec!["a", "c"]);
        assert_eq!(op.failed.len(), 1);
        assert_eq!(op.failed[0].agent_id, "b");
        assert!(op.failed[0].reason.contains("not connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stagger_window_is_respected() {
        let f = fixture(&["a", "b"]);
        f.bulk.start(&ids(&["a", "b"]), None, BulkOptions::default()).await.unwrap();
        advance_ms(10).await;
        assert_eq!(f.transport.begins("b").len(), 0);
        advance_ms(989).await;
        assert_eq!(f.transport.begins("b").len(), 0);
        advance_ms(1_100).await;
        assert_eq!(f.transport.begins("b").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconnected_agents_are_skipped() {
        let f = fixture(&["a"]);
        f.bulk.start(&ids(&["a", "ghost", "a"]), None, BulkOptions::default()).await.unwrap();
        let op = f.bulk.status().await.unwrap();
        assert_eq!(op.pending, VecDeque::from(vec!["a".to_string()]));
        assert_eq!(op.skipped, vec![AgentFailure {
            agent_id: "ghost".to_string(),
            reason: "not connected".to_string(),
        }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_rejected_without_side_effects() {
        let f = fixture(&["a", "b", "c"]);
        let first = f.bulk.start(&ids(&["a", "b"]), None, BulkOptions::default()).await.unwrap();
        advance_ms(10).await;
        let before = f.bulk.status().await.unwrap();

        let err = f.bulk.start(&ids(&["c"]), None, BulkOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));

        let after = f.bulk.status().await.unwrap();
        assert_eq!(after.id, first);
        assert_eq!(after.pending, before.pending);
        assert_eq!(after.started, before.started);
        assert!(f.farm.get("c").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_confirms_and_timer_is_noop() {
        let f = fixture(&["a"]);
        f.bulk.start(&ids(&["a"]), None, BulkOptions::default()).await.unwrap();
        advance_ms(10).await;

        let corr = f.transport.begins("a")[0].clone();
        let done = Telemetry::new("a", &corr, TelemetryEvent::Complete { stats: serde_json::Value::Null });
        f.farm.handle_telemetry(&done).await;
        assert!(f.bulk.on_telemetry("a").await);

        advance_ms(60_000).await;
        let op = f.bulk.status().await.unwrap();
        assert!(op.failed.is_empty());
        assert_eq!(op.started.len(), 1);
        assert!(op.started[0].confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_wins_tie_with_timeout() {
        let f = fixture(&["a"]);
        f.bulk.start(&ids(&["a"]), None, BulkOptions::default()).await.unwrap();
        advance_ms(10).await;

        // The scheduler heard the completion but the orchestrator was never told.
        let corr = f.transport.begins("a")[0].clone();
        let done = Telemetry::new("a", &corr, TelemetryEvent::Complete { stats: serde_json::Value::Null });
        f.farm.handle_telemetry(&done).await;

        advance_ms(31_000).await;
        let op = f.bulk.status().await.unwrap();
        assert!(op.failed.is_empty());
        assert!(op.started[0].confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_agent_fails_and_loop_retries() {
        let f = fixture(&["a", "b"]);
        f.bulk.start(&ids(&["a", "b"]), None, BulkOptions::default()).await.unwrap();
        advance_ms(2_100).await;
        confirm_with_progress(&f, "b").await;

        advance_ms(30_000).await;
        let op = f.bulk.status().await.unwrap();
        assert_eq!(op.failed, vec![AgentFailure {
            agent_id: "a".to_string(),
            reason: "confirmation timeout".to_string(),
        }]);
        assert_eq!(op.started.len(), 1);
        assert_eq!(op.started[0].agent_id, "b");

        // The farm loop was reset rather than abandoned.
        let session = f.farm.get("a").await.unwrap();
        assert_eq!(session.run_state, RunState::Running);
        advance_ms(121_000).await;
        assert_eq!(f.transport.begins("a").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_operation() {
        let f = fixture(&["a", "b", "c"]);
        f.bulk.start(&ids(&["a", "b", "c"]), None, BulkOptions::default()).await.unwrap();
        advance_ms(10).await;

        let stopped = f.bulk.stop().await.unwrap();
        let status = f.bulk.status().await.unwrap();
        assert_eq!(status.status, BulkStatus::Stopped);
        assert!(status.pending.is_empty());
        assert_eq!(status.started, stopped.started);
        assert_eq!(status.failed, stopped.failed);
        assert_eq!(status.started.len(), 1);

        // Neither the stagger nor the confirmation timer fires afterwards.
        advance_ms(120_000).await;
        let later = f.bulk.status().await.unwrap();
        assert_eq!(later.started, stopped.started);
        assert!(later.failed.is_empty());
        assert!(f.farm.get("b").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_farms_stops_started_agents() {
        let f = fixture(&["a", "b"]);
        f.bulk.start(&ids(&["a", "b"]), None, BulkOptions::default()).await.unwrap();
        advance_ms(2_100).await;

        let op = f.bulk.stop_all_farms().await.unwrap();
        assert_eq!(op.started.len(), 2);
        for agent in ["a", "b"] {
            assert_eq!(f.farm.get(agent).await.unwrap().run_state, RunState::Idle);
            assert_eq!(f.transport.halts(agent), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_skipped_completes_immediately() {
        let f = fixture(&["a"]);
        f.bulk.start(&ids(&["ghost1", "ghost2"]), None, BulkOptions::default()).await.unwrap();

        let op = f.bulk.status().await.unwrap();
        assert_eq!(op.status, BulkStatus::Complete);
        assert!(op.finished_at.is_some());
        assert!(op.pending.is_empty());
        assert_eq!(op.skipped.len(), 2);

        // The finished rollout does not block the next one.
        let next = f.bulk.start(&ids(&["a"]), None, BulkOptions::default()).await.unwrap();
        assert_ne!(next, op.id);
        advance_ms(10).await;
        assert_eq!(f.transport.begins("a").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_socket_does_not_block_orchestrator() {
        let f = fixture(&["alice", "slow"]);
        f.farm.start("alice", None).await.unwrap();
        f.transport.stall("slow");

        f.bulk.start(&ids(&["slow"]), None, BulkOptions::default()).await.unwrap();
        advance_ms(10).await;

        let wait = Duration::from_secs(5);
        let op = tokio::time::timeout(wait, f.bulk.status()).await.unwrap().unwrap();
        assert_eq!(op.status, BulkStatus::Running);
        assert!(op.pending.is_empty());
        assert!(op.started.is_empty());

        // Telemetry for other agents still reaches the orchestrator.
        let corr = f.transport.begins("alice")[0].clone();
        let telemetry = Telemetry::new("alice", &corr, TelemetryEvent::Progress { current: 1, total: 5 });
        assert_eq!(f.farm.handle_telemetry(&telemetry).await, TelemetryOutcome::Accepted);
        assert!(!tokio::time::timeout(wait, f.bulk.on_telemetry("alice")).await.unwrap());

        let stopped = tokio::time::timeout(wait, f.bulk.stop()).await.unwrap().unwrap();
        assert_eq!(stopped.status, BulkStatus::Stopped);
        assert!(stopped.started.is_empty());
        assert!(stopped.failed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_between_cycles_is_skipped_not_failed() {
        let f = fixture(&["a", "b"]);
        f.farm.start("a", None).await.unwrap();
        let corr = f.transport.begins("a")[0].clone();
        let done = Telemetry::new("a", &corr, TelemetryEvent::Complete { stats: serde_json::Value::Null });
        f.farm.handle_telemetry(&done).await;
        assert_eq!(f.farm.get("a").await.unwrap().run_state, RunState::Running);

        f.bulk.start(&ids(&["a", "b"]), None, BulkOptions::default()).await.unwrap();
        advance_ms(2_100).await;
        confirm_with_progress(&f, "b").await;
        advance_ms(60_000).await;

        let op = f.bulk.status().await.unwrap();
        assert_eq!(op.status, BulkStatus::Complete);
        assert!(op.failed.is_empty());
        assert_eq!(op.skipped, vec![AgentFailure {
            agent_id: "a".to_string(),
            reason: "already running".to_string(),
        }]);
        let started: Vec<&str> = op.started.iter().map(|s| s.agent_id.as_str()).collect();
        assert_eq!(started, vec!["b"]);
        // The existing loop keeps its own schedule.
        assert_eq!(f.transport.begins("a").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_mid_cycle_is_confirmed_by_its_telemetry() {
        let f = fixture(&["a"]);
        f.farm.start("a", None).await.unwrap();
        assert_eq!(f.farm.get("a").await.unwrap().run_state, RunState::Farming);

        f.bulk.start(&ids(&["a"]), None, BulkOptions::default()).await.unwrap();
        advance_ms(10).await;
        confirm_with_progress(&f, "a").await;
        advance_ms(60_000).await;

        let op = f.bulk.status().await.unwrap();
        assert!(op.failed.is_empty());
        assert!(op.skipped.is_empty());
        assert_eq!(op.started.len(), 1);
        assert!(op.started[0].confirmed);
    }

    #[tokio::test]
    async fn test_randomized_settings_respect_floors() {
        let f = fixture(&[]);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            let s = f.bulk.randomize(&mut rng, FarmSettings::new(6, 1), (2, 3));
            assert!(s.interval_minutes >= 5);
            assert!((3..=9).contains(&s.interval_minutes));
            assert!(s.jitter_minutes <= 4);
        }
    }
}
