use thiserror::Error;

/// Errors that can occur in the durability layer.
///
/// Wrong-state and not-found conditions are not errors: every ledger
/// operation returns a discriminated outcome so callers branch instead of
/// catching. Only infrastructure faults surface here.
#[derive(Debug, Error)]
pub enum DurabilityError {
    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for durability operations.
pub type Result<T> = std::result::Result<T, DurabilityError>;
