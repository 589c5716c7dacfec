use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A unit of work, modeled as data: the handler is named by ID and
/// resolved through the registry at execution time, never captured as a
/// function reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Registered handler ID (e.g. `"engine.execute_command"`).
    pub handler_id: String,

    /// Handler arguments as JSON.
    pub args: serde_json::Value,
}

impl JobSpec {
    /// Creates a job spec.
    pub fn new(handler_id: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            handler_id: handler_id.into(),
            args,
        }
    }
}

/// Workload classes, each backed by an independent pool so that a backlog
/// in one class cannot starve another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    /// Optimistic-concurrency retry re-invocations.
    OccRetry,
    /// Projection application for newly recorded events.
    Projection,
    /// Cross-context event publication.
    Integration,
    /// Durable append of external-action results.
    DurableAppend,
    /// Saga step execution.
    SagaStep,
    /// Background/bulk work (projection rebuild), deliberately capped
    /// lower than live-path classes.
    Rebuild,
}

/// Where to deliver the completion signal for a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionTarget {
    /// Registered completion handler ID.
    pub handler_id: String,

    /// Caller-supplied context passed back verbatim with the signal.
    pub context: serde_json::Value,
}

impl CompletionTarget {
    /// Creates a completion target.
    pub fn new(handler_id: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            handler_id: handler_id.into(),
            context,
        }
    }
}

/// Options controlling how a job is queued.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// The pool class to run under.
    pub class: WorkloadClass,

    /// Jobs sharing a partition key are processed strictly in submission
    /// order and never concurrently.
    pub partition_key: Option<String>,

    /// Minimum delay before the job becomes runnable.
    pub delay: Option<Duration>,

    /// Completion signal target. May be redelivered; the handler must be
    /// idempotent.
    pub on_complete: Option<CompletionTarget>,
}

impl EnqueueOptions {
    /// Creates options for the given class with no partition, delay, or
    /// completion target.
    pub fn class(class: WorkloadClass) -> Self {
        Self {
            class,
            partition_key: None,
            delay: None,
            on_complete: None,
        }
    }

    /// Sets the partition key.
    pub fn partition(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Sets the delay.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the completion target.
    pub fn on_complete(mut self, target: CompletionTarget) -> Self {
        self.on_complete = Some(target);
        self
    }
}

/// Outcome of a unit of work, delivered to the `on_complete` target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionSignal {
    /// The handler succeeded.
    Success {
        /// The handler's return value.
        return_value: serde_json::Value,
    },

    /// The handler failed after all infra-level retries.
    Failed {
        /// The final error message.
        error: String,
        /// Total attempts made (initial + retries).
        attempts: u32,
    },

    /// The work was canceled before it ran.
    Canceled,
}
