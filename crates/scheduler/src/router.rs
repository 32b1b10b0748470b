use farmhand_channels::SessionRegistry;
use farmhand_core::{Reporter, Telemetry};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::bulk::BulkOrchestrator;
use crate::farm_service::FarmScheduler;
use crate::farm_session::TelemetryOutcome;

/// Single consumer of inbound telemetry.
///
/// Order per frame: refresh the agent's `last_seen`, apply to the farm
/// scheduler, and only if the scheduler accepted a start-proving event,
/// settle the bulk confirmation.
pub struct TelemetryRouter {
    registry: Arc<SessionRegistry>,
    farm: Arc<FarmScheduler>,
    bulk: Arc<BulkOrchestrator>,
    reporter: Reporter,
}

impl TelemetryRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        farm: Arc<FarmScheduler>,
        bulk: Arc<BulkOrchestrator>,
        reporter: Reporter,
    ) -> Self {
        Self {
            registry,
            farm,
            bulk,
            reporter,
        }
    }

    pub async fn route(&self, telemetry: Telemetry) -> TelemetryOutcome {
        self.registry.touch(&telemetry.agent_id).await;

        let outcome = self.farm.handle_telemetry(&telemetry).await;
        if outcome == TelemetryOutcome::Accepted && telemetry.event.confirms_start() {
            self.bulk.on_telemetry(&telemetry.agent_id).await;
        }

        debug!(
            agent_id = %telemetry.agent_id,
            correlation_id = %telemetry.correlation_id,
            event = telemetry.event.kind(),
            accepted = outcome == TelemetryOutcome::Accepted,
            "Telemetry routed"
        );
        self.reporter.agent(
            &telemetry.agent_id,
            "telemetry",
            format!("{} telemetry", telemetry.event.kind()),
            json!({
                "telemetry": telemetry,
                "accepted": outcome == TelemetryOutcome::Accepted,
            }),
        );
        outcome
    }

    pub async fn run_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Telemetry>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("TelemetryRouter started");
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(telemetry) => {
                            self.route(telemetry).await;
                        }
                        None => {
                            info!("Telemetry channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("TelemetryRouter shutting down");
                    break;
                }
            }
        }
    }
}
