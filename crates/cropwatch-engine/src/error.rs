//! Engine error types.

use thiserror::Error;

/// Engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("channel error: {0}")]
    Channel(#[from] cropwatch_channel::ChannelError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine already shut down")]
    Disposed,
}

/// Engine result type.
pub type Result<T> = std::result::Result<T, EngineError>;
