pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod report;
pub mod types;

pub use config::{BulkConfig, Config, FarmConfig, GatewayConfig, QueueConfig};
pub use error::{Error, Result};
pub use message::{AgentCommand, Telemetry, TelemetryEvent, TelemetryFrame};
pub use paths::Paths;
pub use report::{BroadcastSink, ReportEvent, ReportSink, Reporter};
pub use types::{FarmSettings, Priority, SessionRole};
