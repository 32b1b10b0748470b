pub mod bulk;
pub mod farm_service;
pub mod farm_session;
pub mod router;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use bulk::{AgentFailure, BulkOperation, BulkOptions, BulkOrchestrator, BulkStatus, StartedAgent};
pub use farm_service::FarmScheduler;
pub use farm_session::{FarmSession, Progress, RunState, StartOutcome, TelemetryOutcome};
pub use router::TelemetryRouter;
pub use watchdog::StallWatchdog;
