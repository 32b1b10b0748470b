use async_trait::async_trait;
use farmhand_core::{AgentCommand, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a send may wait for room in the socket writer's buffer.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// One live link to a remote agent (a browser tab, in practice).
#[async_trait]
pub trait AgentConnection: Send + Sync {
    async fn send(&self, command: &AgentCommand) -> Result<()>;
}

pub type ConnectionHandle = Arc<dyn AgentConnection>;

/// Connection whose frames are written by a socket writer task draining `tx`.
pub struct SocketConnection {
    tx: mpsc::Sender<String>,
}

impl SocketConnection {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    pub fn handle(tx: mpsc::Sender<String>) -> ConnectionHandle {
        Arc::new(Self::new(tx))
    }
}

#[async_trait]
impl AgentConnection for SocketConnection {
    async fn send(&self, command: &AgentCommand) -> Result<()> {
        let frame = serde_json::to_string(&command.to_frame())?;
        match tokio::time::timeout(SEND_TIMEOUT, self.tx.send(frame)).await {
            Ok(sent) => sent.map_err(|e| Error::Transport(e.to_string())),
            Err(_) => Err(Error::Transport("socket writer backed up".to_string())),
        }
    }
}
