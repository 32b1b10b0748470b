//! Reporting sink: a one-way stream of structured events for dashboards.
//!
//! Consumers only observe. Nothing in the core reads these events back, so a
//! slow or absent consumer never affects scheduling.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Subject used for events that are not about a single agent.
pub const SYSTEM_SUBJECT: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportEvent {
    pub timestamp: DateTime<Utc>,
    /// Agent id, or [`SYSTEM_SUBJECT`].
    pub subject: String,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub trait ReportSink: Send + Sync {
    fn emit(&self, event: ReportEvent);
}

/// Fans events out to every subscriber (e.g. the `/v1/events` socket).
pub struct BroadcastSink {
    tx: broadcast::Sender<ReportEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReportEvent> {
        self.tx.subscribe()
    }
}

impl ReportSink for BroadcastSink {
    fn emit(&self, event: ReportEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Cheap handle the core components use to emit events.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn ReportSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ReportSink>) -> Self {
        Self { sink }
    }

    /// A reporter that drops everything.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn agent(&self, agent_id: &str, kind: &str, message: impl Into<String>, data: serde_json::Value) {
        self.emit(agent_id, kind, message.into(), data);
    }

    pub fn system(&self, kind: &str, message: impl Into<String>, data: serde_json::Value) {
        self.emit(SYSTEM_SUBJECT, kind, message.into(), data);
    }

    fn emit(&self, subject: &str, kind: &str, message: String, data: serde_json::Value) {
        debug!(subject = %subject, kind = %kind, "{}", message);
        self.sink.emit(ReportEvent {
            timestamp: Utc::now(),
            subject: subject.to_string(),
            kind: kind.to_string(),
            message,
            data,
        });
    }
}

struct NullSink;

impl ReportSink for NullSink {
    fn emit(&self, _event: ReportEvent) {}
}
