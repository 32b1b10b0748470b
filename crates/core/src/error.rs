use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The agent has no live master session, so nothing can be dispatched to it.
    #[error("Agent not connected: {0}")]
    NotConnected(String),

    #[error("Session {session_id} is not registered for agent {agent_id}")]
    SessionNotFound {
        agent_id: String,
        session_id: String,
    },

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Structural failures: the operation could not even be attempted.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::NotConnected(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
