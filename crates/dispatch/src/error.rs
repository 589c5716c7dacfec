use thiserror::Error;

/// Errors that can occur when enqueuing work.
///
/// Handler failures are not errors here: they are reported to the
/// `on_complete` target as a `failed` completion signal after the pool's
/// infra-level retries are exhausted.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher (or a partition lane) has shut down.
    #[error("Dispatcher closed: {0}")]
    Closed(String),
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
