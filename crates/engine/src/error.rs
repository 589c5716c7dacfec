use thiserror::Error;

/// Errors that can occur while executing commands.
///
/// Business outcomes (`rejected`, `failed`, `duplicate`, `deferred`) are
/// never errors; they are variants of [`crate::CommandOutcome`]. Version
/// conflicts are absorbed by the retry engine. This enum covers
/// infrastructure faults and wiring mistakes only.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    /// Dispatch error.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] dispatch::DispatchError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No decider is registered for the command type.
    #[error("No decider registered for command type: {0}")]
    UnknownCommandType(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
