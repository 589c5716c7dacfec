use thiserror::Error;

/// Errors that can occur when interacting with the transactional store.
///
/// Version conflicts and duplicate inserts are *not* errors: they are
/// expected outcomes reported through [`crate::WriteOutcome`],
/// [`crate::InsertOutcome`], [`crate::AppendOutcome`] and
/// [`crate::CommitOutcome`]. This enum covers infrastructure faults only.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
