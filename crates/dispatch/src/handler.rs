use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::CompletionSignal;

/// Error returned by a job handler. Treated as an infrastructure fault:
/// the pool retries, then routes a `failed` signal to the completion
/// target. Expected business outcomes belong in the return value, not
/// here.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct JobError(pub String);

impl JobError {
    /// Creates a job error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A registered job handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs the job with the given args.
    async fn run(&self, args: serde_json::Value) -> Result<serde_json::Value, JobError>;
}

/// A registered completion handler.
///
/// Completion signals may be redelivered; implementations must be
/// idempotent with respect to their effects.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    /// Receives a completion signal with the caller-supplied context.
    async fn on_complete(&self, signal: CompletionSignal, context: serde_json::Value);
}

/// Explicit registry of job and completion handlers.
///
/// Constructed once at process start and passed by reference; there is no
/// module-level registry.
#[derive(Default)]
pub struct HandlerRegistry {
    jobs: HashMap<String, Arc<dyn JobHandler>>,
    completions: HashMap<String, Arc<dyn CompletionHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job handler under an ID. Replaces any existing handler
    /// with the same ID.
    pub fn register_job(&mut self, handler_id: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.jobs.insert(handler_id.into(), handler);
    }

    /// Registers a completion handler under an ID.
    pub fn register_completion(
        &mut self,
        handler_id: impl Into<String>,
        handler: Arc<dyn CompletionHandler>,
    ) {
        self.completions.insert(handler_id.into(), handler);
    }

    /// Resolves a job handler.
    pub fn job(&self, handler_id: &str) -> Option<Arc<dyn JobHandler>> {
        self.jobs.get(handler_id).cloned()
    }

    /// Resolves a completion handler.
    pub fn completion(&self, handler_id: &str) -> Option<Arc<dyn CompletionHandler>> {
        self.completions.get(handler_id).cloned()
    }

    /// Returns the number of registered job handlers.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, args: serde_json::Value) -> Result<serde_json::Value, JobError> {
            Ok(args)
        }
    }

    #[tokio::test]
    async fn register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register_job("echo", Arc::new(Echo));

        let handler = registry.job("echo").unwrap();
        let out = handler.run(serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(out, serde_json::json!({"x": 1}));

        assert!(registry.job("missing").is_none());
        assert_eq!(registry.job_count(), 1);
    }
}
