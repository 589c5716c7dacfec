use thiserror::Error;

/// Errors that can occur in the saga engine.
///
/// Business outcomes (a step's failure triggering compensation, invalid
/// status transitions) are discriminated results, not errors. This enum
/// covers infrastructure faults and broken invariants.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    /// Command engine error.
    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    /// Dispatch error.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] dispatch::DispatchError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No step executor is registered for the saga type.
    #[error("No executor registered for saga type: {0}")]
    UnknownSagaType(String),

    /// An executor was asked to run a step it does not define.
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// A deferred command did not conclude within the step's wait budget.
    #[error("Timed out waiting for command {0} to conclude")]
    StepTimeout(String),
}

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;
