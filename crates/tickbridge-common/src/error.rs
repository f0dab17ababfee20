use crate::protocol::ContextId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Connect/send/receive failure reported by a transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The operation was aborted at a progress checkpoint.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Job queue is full ({capacity} jobs pending)")]
    QueueFull { capacity: usize },

    #[error("Execution context {0} is gone")]
    ContextGone(ContextId),

    /// A script callback raised an error while being invoked.
    #[error("Callback error: {0}")]
    Callback(String),

    /// Admission ordering could not be honoured; fatal to one connection only.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Bridge is shut down")]
    Shutdown,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Returns true if this error ends only the connection that produced it.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_) | Self::Shutdown)
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
