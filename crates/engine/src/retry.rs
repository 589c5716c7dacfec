//! OCC conflict retry engine.
//!
//! A version conflict is not an error: the command is re-enqueued as data
//! (`{handler_id, args}`) on the scope's FIFO partition after an
//! exponential backoff, carrying the incremented attempt count and the
//! conflicting version. After `max_attempts` the caller gets a rejection
//! with code [`DCB_MAX_RETRIES_EXCEEDED`].

use std::sync::Arc;

use dispatch::{EnqueueOptions, JobDispatcher, JobSpec, WorkloadClass};
use serde::{Deserialize, Serialize};
use store::Version;

use crate::backoff::{delay, Jitter};
use crate::error::Result;
use crate::outcome::CommandOutcome;
use crate::registry::Command;
use crate::scope::ScopeKey;

/// Handler ID the orchestrator's job adapter is registered under.
pub const EXECUTE_COMMAND_HANDLER: &str = "engine.execute_command";

/// Rejection code returned when the retry budget is exhausted.
pub const DCB_MAX_RETRIES_EXCEEDED: &str = "DCB_MAX_RETRIES_EXCEEDED";

/// Retry budget and backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Conflicts at `attempt >= max_attempts` are rejected instead of
    /// retried.
    pub max_attempts: u32,

    /// Backoff delay for attempt 0.
    pub initial_backoff_ms: u64,

    /// Exponential base.
    pub base: f64,

    /// Backoff ceiling.
    pub max_backoff_ms: u64,

    /// Jitter applied to the computed delay.
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            base: 2.0,
            max_backoff_ms: 30_000,
            jitter: Jitter::default(),
        }
    }
}

/// Arguments of a re-enqueued command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryArgs {
    /// The command, unchanged across attempts.
    pub command: Command,

    /// The attempt this re-invocation runs as.
    pub attempt: u32,

    /// The scope version observed at conflict time. The re-invocation
    /// re-reads fresh state; this is carried for observability.
    pub expected_version: Version,
}

/// Schedules conflicted commands for re-execution on their scope's
/// partition.
#[derive(Clone)]
pub struct RetryEngine {
    dispatcher: Arc<dyn JobDispatcher>,
    policy: RetryPolicy,
}

impl RetryEngine {
    /// Creates a retry engine.
    pub fn new(dispatcher: Arc<dyn JobDispatcher>, policy: RetryPolicy) -> Self {
        Self { dispatcher, policy }
    }

    /// The engine's policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handles a version conflict observed while committing `command` at
    /// `attempt`. Either schedules a retry (`Deferred`) or gives up
    /// (`Rejected` with [`DCB_MAX_RETRIES_EXCEEDED`]).
    #[tracing::instrument(skip(self, command), fields(command_id = %command.command_id, scope = %scope))]
    pub async fn handle_conflict(
        &self,
        command: &Command,
        scope: &ScopeKey,
        attempt: u32,
        current_version: Version,
    ) -> Result<CommandOutcome> {
        metrics::counter!("command_conflicts_total").increment(1);

        if attempt >= self.policy.max_attempts {
            tracing::warn!(attempt, %current_version, "retry budget exhausted");
            return Ok(CommandOutcome::Rejected {
                code: DCB_MAX_RETRIES_EXCEEDED.to_string(),
                reason: format!(
                    "scope {scope} conflicted {attempt} times, last version {current_version}"
                ),
            });
        }

        let delay_ms = delay(
            attempt,
            self.policy.initial_backoff_ms,
            self.policy.base,
            self.policy.max_backoff_ms,
            &self.policy.jitter,
        );
        let args = RetryArgs {
            command: command.clone(),
            attempt: attempt + 1,
            expected_version: current_version,
        };

        let work_id = self
            .dispatcher
            .enqueue(
                JobSpec::new(EXECUTE_COMMAND_HANDLER, serde_json::to_value(&args)?),
                EnqueueOptions::class(WorkloadClass::OccRetry)
                    .partition(scope.partition_key())
                    .after(std::time::Duration::from_millis(delay_ms)),
            )
            .await?;

        tracing::info!(%work_id, retry_attempt = attempt + 1, delay_ms, "conflict deferred");
        Ok(CommandOutcome::Deferred {
            work_id,
            retry_attempt: attempt + 1,
            scheduled_after_ms: delay_ms,
        })
    }
}
