use chrono::{DateTime, Utc};
use farmhand_core::{AgentCommand, Priority, QueueConfig, Reporter};
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::rate_limit::DispatchPacer;
use crate::transport::AgentTransport;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Executing,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub agent_id: String,
    pub payload: AgentCommand,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub status: QueueItemStatus,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum DispatchOutcome {
    Dispatched,
    Dropped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    pub queue_id: String,
    pub agent_id: String,
    pub action: String,
    pub priority: Priority,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCooldown {
    pub agent_id: String,
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub processing: bool,
    pub items: Vec<QueueItem>,
    pub cooldowns: Vec<AgentCooldown>,
    pub global_wait_ms: u64,
    /// Most recent first.
    pub history: Vec<DispatchRecord>,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    pacer: DispatchPacer,
    processing: bool,
    history: VecDeque<DispatchRecord>,
}

enum Step {
    Idle,
    Wait(Duration),
    Dispatch(QueueItem),
}

/// The single outbound queue for commands to every agent.
///
/// Items are ordered by priority class, FIFO within a class. One processor
/// task drains the queue: it takes the first item whose agent is out of
/// cooldown, waits out the global gap, and dispatches through the master
/// connection resolved at that moment. Items whose agent is cooling down are
/// skipped, so equal-priority items can leave out of enqueue order.
pub struct CommandQueue {
    transport: Arc<dyn AgentTransport>,
    reporter: Reporter,
    history_limit: usize,
    state: Mutex<QueueState>,
    wake: Notify,
}

impl CommandQueue {
    pub fn new(config: &QueueConfig, transport: Arc<dyn AgentTransport>, reporter: Reporter) -> Self {
        Self::with_pacer(config, DispatchPacer::new(config), transport, reporter)
    }

    pub fn with_pacer(
        config: &QueueConfig,
        pacer: DispatchPacer,
        transport: Arc<dyn AgentTransport>,
        reporter: Reporter,
    ) -> Self {
        Self {
            transport,
            reporter,
            history_limit: config.history_limit,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                pacer,
                processing: false,
                history: VecDeque::new(),
            }),
            wake: Notify::new(),
        }
    }

    /// Queues a command and makes sure the processor is running. Returns the queue id.
    pub async fn enqueue(self: &Arc<Self>, agent_id: &str, payload: AgentCommand, priority: Priority) -> String {
        let item = QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            payload,
            priority,
            enqueued_at: Utc::now(),
            status: QueueItemStatus::Pending,
        };
        let id = item.id.clone();
        let action = item.payload.action.clone();

        let (position, depth) = {
            let mut state = self.state.lock().await;
            let position = state
                .items
                .iter()
                .position(|i| i.status == QueueItemStatus::Pending && i.priority < priority)
                .unwrap_or(state.items.len());
            state.items.insert(position, item);

            if state.processing {
                self.wake.notify_one();
            } else {
                state.processing = true;
                tokio::spawn(self.clone().process());
            }
            (position, state.items.len())
        };

        debug!(queue_id = %id, agent_id = %agent_id, priority = %priority, position, "Command enqueued");
        self.reporter.agent(
            agent_id,
            "queue_enqueued",
            format!("{} queued at position {} ({})", action, position, priority),
            json!({ "queueId": id, "action": action, "priority": priority, "position": position, "depth": depth }),
        );
        id
    }

    /// Removes pending commands for one agent. In-flight commands are not recalled.
    pub async fn cancel_for_agent(&self, agent_id: &str) -> usize {
        let removed = {
            let mut state = self.state.lock().await;
            let before = state.items.len();
            state
                .items
                .retain(|i| i.agent_id != agent_id || i.status == QueueItemStatus::Executing);
            before - state.items.len()
        };
        if removed > 0 {
            self.wake.notify_one();
            info!(agent_id = %agent_id, removed, "Cancelled queued commands");
            self.reporter.agent(
                agent_id,
                "queue_cancelled",
                format!("{} queued commands cancelled", removed),
                json!({ "removed": removed }),
            );
        }
        removed
    }

    /// Removes every pending command.
    pub async fn clear_all(&self) -> usize {
        let removed = {
            let mut state = self.state.lock().await;
            let before = state.items.len();
            state.items.retain(|i| i.status == QueueItemStatus::Executing);
            before - state.items.len()
        };
        if removed > 0 {
            self.wake.notify_one();
        }
        info!(removed, "Cleared command queue");
        self.reporter.system(
            "queue_cleared",
            format!("{} queued commands cleared", removed),
            json!({ "removed": removed }),
        );
        removed
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        QueueStatus {
            processing: state.processing,
            items: state.items.iter().cloned().collect(),
            cooldowns: state
                .pacer
                .cooldowns(now)
                .into_iter()
                .map(|(agent_id, left)| AgentCooldown {
                    agent_id,
                    remaining_ms: left.as_millis() as u64,
                })
                .collect(),
            global_wait_ms: state.pacer.global_wait(now).as_millis() as u64,
            history: state.history.iter().rev().cloned().collect(),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn process(self: Arc<Self>) {
        debug!("Queue processor started");
        loop {
            let step = {
                let mut state = self.state.lock().await;
                Self::next_step(&mut state, Instant::now())
            };
            match step {
                Step::Idle => break,
                Step::Wait(wait) => {
                    // A new enqueue or a cancellation may change what is eligible.
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Step::Dispatch(item) => self.dispatch(item).await,
            }
        }
        debug!("Queue processor idle");
    }

    fn next_step(state: &mut QueueState, now: Instant) -> Step {
        let mut soonest: Option<Duration> = None;
        let mut candidate = None;
        for (idx, item) in state.items.iter().enumerate() {
            if item.status != QueueItemStatus::Pending {
                continue;
            }
            match state.pacer.cooldown_remaining(&item.agent_id, now) {
                None => {
                    candidate = Some(idx);
                    break;
                }
                Some(left) => soonest = Some(soonest.map_or(left, |s| s.min(left))),
            }
        }

        match (candidate, soonest) {
            (Some(idx), _) => {
                let wait = state.pacer.global_wait(now);
                if !wait.is_zero() {
                    // Rescan afterwards: a higher-priority item may arrive meanwhile.
                    return Step::Wait(wait);
                }
                let item = &mut state.items[idx];
                item.status = QueueItemStatus::Executing;
                Step::Dispatch(item.clone())
            }
            (None, Some(left)) => Step::Wait(left),
            (None, None) => {
                state.processing = false;
                Step::Idle
            }
        }
    }

    async fn dispatch(&self, item: QueueItem) {
        let delivered = self.transport.send(&item.agent_id, &item.payload).await;

        let outcome = {
            let mut state = self.state.lock().await;
            state.items.retain(|i| i.id != item.id);
            let outcome = if delivered {
                state.pacer.record_dispatch(&item.agent_id, Instant::now());
                DispatchOutcome::Dispatched
            } else {
                DispatchOutcome::Dropped {
                    reason: "agent not connected".to_string(),
                }
            };
            state.history.push_back(DispatchRecord {
                queue_id: item.id.clone(),
                agent_id: item.agent_id.clone(),
                action: item.payload.action.clone(),
                priority: item.priority,
                at: Utc::now(),
                outcome: outcome.clone(),
            });
            while state.history.len() > self.history_limit {
                state.history.pop_front();
            }
            outcome
        };

        match &outcome {
            DispatchOutcome::Dispatched => {
                info!(queue_id = %item.id, agent_id = %item.agent_id, action = %item.payload.action, "Command dispatched");
                self.reporter.agent(
                    &item.agent_id,
                    "queue_dispatched",
                    format!("{} dispatched", item.payload.action),
                    json!({ "queueId": item.id, "action": item.payload.action, "priority": item.priority }),
                );
            }
            DispatchOutcome::Dropped { reason } => {
                warn!(queue_id = %item.id, agent_id = %item.agent_id, reason = %reason, "Command dropped");
                self.reporter.agent(
                    &item.agent_id,
                    "queue_dispatch_failed",
                    format!("{} dropped: {}", item.payload.action, reason),
                    json!({ "queueId": item.id, "action": item.payload.action, "reason": reason }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};

    /// Records the instant and target of every delivered command.
    struct RecordingTransport {
        connected: std::sync::Mutex<HashSet<String>>,
        sent: std::sync::Mutex<Vec<(Instant, String, String)>>,
    }

    impl RecordingTransport {
        fn new(agents: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                connected: std::sync::Mutex::new(agents.iter().map(|a| a.to_string()).collect()),
                sent: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(Instant, String, String)> {
            self.sent.lock().unwrap().clone()
        }

        fn labels(&self) -> Vec<String> {
            self.sent().into_iter().map(|(_, _, label)| label).collect()
        }
    }

    #[async_trait]
    impl AgentTransport for RecordingTransport {
        async fn send(&self, agent_id: &str, command: &AgentCommand) -> bool {
            if !self.connected.lock().unwrap().contains(agent_id) {
                return false;
            }
            let label = command.payload["label"].as_str().unwrap_or_default().to_string();
            self.sent
                .lock()
                .unwrap()
                .push((Instant::now(), agent_id.to_string(), label));
            true
        }

        async fn has_master(&self, agent_id: &str) -> bool {
            self.connected.lock().unwrap().contains(agent_id)
        }
    }

    fn command(label: &str) -> AgentCommand {
        AgentCommand::new("test.noop", json!({ "label": label }))
    }

    fn config() -> QueueConfig {
        QueueConfig {
            min_delay_ms: 5_000,
            max_delay_ms: 15_000,
            agent_cooldown_ms: 30_000,
            history_limit: 10,
        }
    }

    fn queue(transport: Arc<RecordingTransport>) -> Arc<CommandQueue> {
        let cfg = config();
        Arc::new(CommandQueue::with_pacer(
            &cfg,
            DispatchPacer::new(&cfg).with_seed(42),
            transport,
            Reporter::disabled(),
        ))
    }

    async fn drain(queue: &CommandQueue) {
        for _ in 0..10_000 {
            if queue.is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("queue never drained");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_holds_for_any_enqueue_sequence() {
        let transport = RecordingTransport::new(&["a", "b", "c"]);
        let q = queue(transport.clone());
        let plan = [
            ("a", Priority::Normal),
            ("a", Priority::High),
            ("b", Priority::Low),
            ("c", Priority::Normal),
            ("a", Priority::Normal),
            ("b", Priority::High),
            ("c", Priority::Low),
            ("b", Priority::Normal),
        ];
        for (i, (agent, priority)) in plan.iter().enumerate() {
            q.enqueue(agent, command(&i.to_string()), *priority).await;
            if i % 3 == 2 {
                tokio::time::sleep(Duration::from_secs(4)).await;
            }
        }
        drain(&q).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), plan.len());
        for pair in sent.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_secs(5));
        }
        let mut last_by_agent: HashMap<String, Instant> = HashMap::new();
        for (at, agent, _) in &sent {
            if let Some(prev) = last_by_agent.insert(agent.clone(), *at) {
                assert!(*at - prev >= Duration::from_secs(30), "cooldown violated for {}", agent);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_jumps_ahead() {
        let transport = RecordingTransport::new(&["a", "b", "c"]);
        let q = queue(transport.clone());
        q.enqueue("a", command("a-normal"), Priority::Normal).await;
        q.enqueue("b", command("b-low"), Priority::Low).await;
        q.enqueue("c", command("c-high"), Priority::High).await;

        let order: Vec<String> = q
            .status()
            .await
            .items
            .iter()
            .map(|i| i.payload.payload["label"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["c-high", "a-normal", "b-low"]);

        drain(&q).await;
        assert_eq!(transport.labels(), vec!["c-high", "a-normal", "b-low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_lets_other_agents_pass() {
        let transport = RecordingTransport::new(&["a", "b"]);
        let q = queue(transport.clone());

        q.enqueue("a", command("warmup"), Priority::Normal).await;
        drain(&q).await;
        let warmup_at = transport.sent()[0].0;

        q.enqueue("a", command("a-high"), Priority::High).await;
        q.enqueue("b", command("b-normal"), Priority::Normal).await;
        q.enqueue("a", command("a-normal"), Priority::Normal).await;
        drain(&q).await;

        assert_eq!(
            transport.labels(),
            vec!["warmup", "b-normal", "a-high", "a-normal"]
        );
        let sent = transport.sent();
        assert!(sent[2].0 - warmup_at >= Duration::from_secs(30));
        assert!(sent[3].0 - sent[2].0 >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_master_drops_item() {
        let transport = RecordingTransport::new(&["b"]);
        let q = queue(transport.clone());
        q.enqueue("ghost", command("lost"), Priority::High).await;
        q.enqueue("b", command("kept"), Priority::Normal).await;
        drain(&q).await;

        assert_eq!(transport.labels(), vec!["kept"]);
        let status = q.status().await;
        assert_eq!(status.history.len(), 2);
        assert_eq!(status.history[0].outcome, DispatchOutcome::Dispatched);
        assert!(matches!(
            &status.history[1].outcome,
            DispatchOutcome::Dropped { reason } if reason.contains("not connected")
        ));
        // The drop did not consume a timing slot, so "kept" went out right away.
        assert!(status.cooldowns.iter().all(|c| c.agent_id != "ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_clear() {
        let transport = RecordingTransport::new(&["a", "b"]);
        let q = queue(transport.clone());
        q.enqueue("a", command("a1"), Priority::Normal).await;
        drain(&q).await;

        q.enqueue("a", command("a2"), Priority::Normal).await;
        q.enqueue("a", command("a3"), Priority::Low).await;
        q.enqueue("b", command("b1"), Priority::Normal).await;
        tokio::task::yield_now().await;

        // a2 and a3 are cooling down; b1 may already be in flight.
        assert_eq!(q.cancel_for_agent("a").await, 2);
        assert_eq!(q.cancel_for_agent("a").await, 0);

        q.enqueue("b", command("b2"), Priority::Normal).await;
        let pending = q
            .status()
            .await
            .items
            .iter()
            .filter(|i| i.status == QueueItemStatus::Pending)
            .count();
        assert_eq!(q.clear_all().await, pending);

        drain(&q).await;
        assert!(!transport.labels().contains(&"a2".to_string()));
        assert!(!transport.labels().contains(&"a3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let transport = RecordingTransport::new(&[]);
        let q = queue(transport.clone());
        for i in 0..15 {
            q.enqueue("nobody", command(&i.to_string()), Priority::Normal).await;
        }
        drain(&q).await;
        let status = q.status().await;
        assert_eq!(status.history.len(), 10);
        assert!(!status.processing);
    }
}
