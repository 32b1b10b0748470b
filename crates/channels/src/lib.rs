//! Agent-facing plumbing: live sessions per agent and the paced outbound queue.
pub mod connection;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod transport;

pub use connection::{AgentConnection, ConnectionHandle, SocketConnection};
pub use queue::{CommandQueue, DispatchOutcome, DispatchRecord, QueueItem, QueueItemStatus, QueueStatus};
pub use rate_limit::DispatchPacer;
pub use registry::{AgentInfo, AgentStatus, Registration, SessionInfo, SessionRegistry};
pub use transport::AgentTransport;
