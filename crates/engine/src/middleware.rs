//! Command middleware pipeline.
//!
//! Middleware runs before the decider, in ascending priority order, and
//! may short-circuit the command with a rejection. Slots by convention:
//! schema validation 10, domain validation 20, authorization 30, logging
//! 40, rate limiting 50.

use async_trait::async_trait;

use crate::registry::Command;

/// Conventional priority slots.
pub mod priority {
    pub const SCHEMA_VALIDATION: u8 = 10;
    pub const DOMAIN_VALIDATION: u8 = 20;
    pub const AUTHORIZATION: u8 = 30;
    pub const LOGGING: u8 = 40;
    pub const RATE_LIMITING: u8 = 50;
}

/// What a middleware decided about a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiddlewareVerdict {
    /// Continue with the next middleware (or the decider).
    Pass,

    /// Short-circuit with a rejection. Nothing is recorded.
    Reject {
        /// Machine-readable rejection code.
        code: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// A pipeline stage run before the decider.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Ordering slot; lower runs first.
    fn priority(&self) -> u8;

    /// Name used in logs.
    fn name(&self) -> &str;

    /// Inspects the command.
    async fn call(&self, command: &Command) -> MiddlewareVerdict;
}

/// An ordered middleware pipeline.
#[derive(Default)]
pub struct MiddlewarePipeline {
    stages: Vec<Box<dyn Middleware>>,
}

impl MiddlewarePipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a middleware, keeping the pipeline sorted by priority. Equal
    /// priorities keep insertion order.
    pub fn add(&mut self, middleware: Box<dyn Middleware>) {
        self.stages.push(middleware);
        self.stages.sort_by_key(|m| m.priority());
    }

    /// Runs all stages in order. Returns the first rejection, if any.
    pub async fn run(&self, command: &Command) -> MiddlewareVerdict {
        for stage in &self.stages {
            if let MiddlewareVerdict::Reject { code, reason } = stage.call(command).await {
                tracing::info!(
                    middleware = stage.name(),
                    command_id = %command.command_id,
                    code,
                    "command rejected by middleware"
                );
                return MiddlewareVerdict::Reject { code, reason };
            }
        }
        MiddlewareVerdict::Pass
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Structural validation of the command envelope.
pub struct SchemaValidation;

#[async_trait]
impl Middleware for SchemaValidation {
    fn priority(&self) -> u8 {
        priority::SCHEMA_VALIDATION
    }

    fn name(&self) -> &str {
        "schema_validation"
    }

    async fn call(&self, command: &Command) -> MiddlewareVerdict {
        if command.command_id.as_str().is_empty() {
            return MiddlewareVerdict::Reject {
                code: "INVALID_COMMAND".to_string(),
                reason: "command_id must not be empty".to_string(),
            };
        }
        if command.command_type.is_empty() {
            return MiddlewareVerdict::Reject {
                code: "INVALID_COMMAND".to_string(),
                reason: "command_type must not be empty".to_string(),
            };
        }
        if !command.args.is_object() {
            return MiddlewareVerdict::Reject {
                code: "INVALID_COMMAND".to_string(),
                reason: "args must be a JSON object".to_string(),
            };
        }
        MiddlewareVerdict::Pass
    }
}

/// Logs every command passing through the pipeline.
pub struct RequestLogging;

#[async_trait]
impl Middleware for RequestLogging {
    fn priority(&self) -> u8 {
        priority::LOGGING
    }

    fn name(&self) -> &str {
        "request_logging"
    }

    async fn call(&self, command: &Command) -> MiddlewareVerdict {
        tracing::info!(
            command_id = %command.command_id,
            command_type = %command.command_type,
            tenant = %command.tenant,
            correlation_id = command.correlation_id.as_ref().map(|c| c.as_str()),
            "executing command"
        );
        MiddlewareVerdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectAt {
        at: u8,
        code: &'static str,
    }

    #[async_trait]
    impl Middleware for RejectAt {
        fn priority(&self) -> u8 {
            self.at
        }

        fn name(&self) -> &str {
            "reject_at"
        }

        async fn call(&self, _command: &Command) -> MiddlewareVerdict {
            MiddlewareVerdict::Reject {
                code: self.code.to_string(),
                reason: "test".to_string(),
            }
        }
    }

    fn command() -> Command {
        Command::new("cmd-1", "PlaceOrder", "acme", serde_json::json!({}))
    }

    #[tokio::test]
    async fn stages_run_in_priority_order() {
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Box::new(RejectAt { at: 30, code: "LATER" }));
        pipeline.add(Box::new(RejectAt { at: 10, code: "FIRST" }));

        match pipeline.run(&command()).await {
            MiddlewareVerdict::Reject { code, .. } => assert_eq!(code, "FIRST"),
            MiddlewareVerdict::Pass => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn empty_pipeline_passes() {
        let pipeline = MiddlewarePipeline::new();
        assert_eq!(pipeline.run(&command()).await, MiddlewareVerdict::Pass);
    }

    #[tokio::test]
    async fn schema_validation_rejects_non_object_args() {
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Box::new(SchemaValidation));

        let bad = Command::new("cmd-1", "PlaceOrder", "acme", serde_json::json!([1, 2]));
        assert!(matches!(
            pipeline.run(&bad).await,
            MiddlewareVerdict::Reject { code, .. } if code == "INVALID_COMMAND"
        ));
        assert_eq!(pipeline.run(&command()).await, MiddlewareVerdict::Pass);
    }

    #[tokio::test]
    async fn schema_validation_rejects_empty_command_id() {
        let bad = Command::new("", "PlaceOrder", "acme", serde_json::json!({}));
        assert!(matches!(
            SchemaValidation.call(&bad).await,
            MiddlewareVerdict::Reject { .. }
        ));
    }
}
