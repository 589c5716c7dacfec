//! Saga lifecycle management.
//!
//! The engine owns the saga status rows and launches each saga's workflow
//! through the job dispatcher. Status only changes through the completion
//! callback or an explicit admin operation; the forward steps never touch
//! the row themselves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, WorkId};
use dispatch::{
    CompletionHandler, CompletionSignal, CompletionTarget, EnqueueOptions, JobDispatcher,
    JobError, JobHandler, JobSpec, WorkloadClass,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::record::{CreateOutcome, SagaRecord, SagaStore, TransitionOutcome};
use crate::status::SagaStatus;
use crate::workflow::{StepExecutor, WorkflowResult, WorkflowRunner};

/// Handler ID for the job that drives a saga's workflow.
pub const RUN_WORKFLOW_HANDLER: &str = "saga.run_workflow";

/// Handler ID for the completion callback that records the saga's
/// terminal status.
pub const SAGA_COMPLETION_HANDLER: &str = "saga.completion";

/// Outcome of [`SagaEngine::start`].
#[derive(Debug)]
pub enum StartOutcome {
    /// A new saga row was created and its workflow enqueued.
    Started {
        /// The enqueued workflow job.
        work_id: WorkId,
    },

    /// A saga with this `(saga_type, saga_id)` already exists.
    AlreadyStarted(SagaRecord),
}

#[derive(Debug, Serialize, Deserialize)]
struct RunWorkflowArgs {
    saga_type: String,
    saga_id: String,
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct CompletionContext {
    saga_type: String,
    saga_id: String,
}

/// Orchestrates saga creation, execution, and status recording.
pub struct SagaEngine {
    sagas: SagaStore,
    runner: Arc<dyn WorkflowRunner>,
    dispatcher: Arc<dyn JobDispatcher>,
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl SagaEngine {
    /// Creates an engine with no registered saga types.
    pub fn new(
        sagas: SagaStore,
        runner: Arc<dyn WorkflowRunner>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            sagas,
            runner,
            dispatcher,
            executors: HashMap::new(),
        }
    }

    /// Registers the step executor for a saga type.
    pub fn register(mut self, saga_type: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.executors.insert(saga_type.into(), executor);
        self
    }

    /// Accessor for the saga status store.
    pub fn sagas(&self) -> &SagaStore {
        &self.sagas
    }

    /// Starts a saga: creates the `pending` row, enqueues the workflow on
    /// the saga's partition, and moves the row to `running`. A second
    /// start with the same identity is a no-op.
    #[tracing::instrument(skip(self, args))]
    pub async fn start(
        &self,
        saga_type: &str,
        saga_id: &str,
        args: serde_json::Value,
        trigger_event_id: Option<EventId>,
    ) -> Result<StartOutcome> {
        if !self.executors.contains_key(saga_type) {
            return Err(SagaError::UnknownSagaType(saga_type.to_string()));
        }

        let workflow_id = SagaRecord::key(saga_type, saga_id);
        match self
            .sagas
            .create(saga_type, saga_id, &workflow_id, trigger_event_id)
            .await?
        {
            CreateOutcome::Created(_) => {}
            CreateOutcome::Exists(record) => {
                tracing::info!(saga_type, saga_id, "saga already started");
                return Ok(StartOutcome::AlreadyStarted(record));
            }
        }

        // Move to running before the launch so the completion callback
        // never observes a pending row.
        self.sagas
            .transition(saga_type, saga_id, SagaStatus::Running, None)
            .await?;
        let work_id = self.launch(saga_type, saga_id, args).await?;

        metrics::counter!("sagas_started_total", "saga_type" => saga_type.to_string())
            .increment(1);
        tracing::info!(saga_type, saga_id, %work_id, "saga started");
        Ok(StartOutcome::Started { work_id })
    }

    async fn launch(
        &self,
        saga_type: &str,
        saga_id: &str,
        args: serde_json::Value,
    ) -> Result<WorkId> {
        let job = JobSpec::new(
            RUN_WORKFLOW_HANDLER,
            serde_json::to_value(RunWorkflowArgs {
                saga_type: saga_type.to_string(),
                saga_id: saga_id.to_string(),
                args,
            })?,
        );
        let context = serde_json::to_value(CompletionContext {
            saga_type: saga_type.to_string(),
            saga_id: saga_id.to_string(),
        })?;
        let options = EnqueueOptions::class(WorkloadClass::SagaStep)
            .partition(format!("saga:{saga_type}:{saga_id}"))
            .on_complete(CompletionTarget::new(SAGA_COMPLETION_HANDLER, context));
        Ok(self.dispatcher.enqueue(job, options).await?)
    }

    /// Re-launches a `failed` saga. The workflow checkpoint is still in
    /// place, so only the steps after the last completed one run again.
    pub async fn retry(
        &self,
        saga_type: &str,
        saga_id: &str,
        args: serde_json::Value,
    ) -> Result<TransitionOutcome> {
        let outcome = self
            .sagas
            .transition(saga_type, saga_id, SagaStatus::Pending, None)
            .await?;
        if let TransitionOutcome::Transitioned(_) = &outcome {
            self.sagas
                .transition(saga_type, saga_id, SagaStatus::Running, None)
                .await?;
            self.launch(saga_type, saga_id, args).await?;
        }
        Ok(outcome)
    }

    /// Cancels a saga: flags the workflow so the run stops before its next
    /// step, and records the row as `failed`.
    pub async fn cancel(&self, saga_type: &str, saga_id: &str) -> Result<TransitionOutcome> {
        self.runner
            .cancel(&SagaRecord::key(saga_type, saga_id))
            .await?;
        self.sagas
            .transition(saga_type, saga_id, SagaStatus::Failed, Some("canceled"))
            .await
    }

    /// Admin override: marks a saga `failed` with the given error.
    pub async fn mark_failed(
        &self,
        saga_type: &str,
        saga_id: &str,
        error: &str,
    ) -> Result<TransitionOutcome> {
        self.sagas
            .transition(saga_type, saga_id, SagaStatus::Failed, Some(error))
            .await
    }

    /// Admin override: marks a `compensating` saga `compensated`, for the
    /// case where compensation concluded out of band.
    pub async fn mark_compensated(
        &self,
        saga_type: &str,
        saga_id: &str,
    ) -> Result<TransitionOutcome> {
        self.sagas
            .transition(saga_type, saga_id, SagaStatus::Compensated, None)
            .await
    }

    /// Deletes terminal saga rows older than the retention horizon.
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.sagas.cleanup(older_than).await
    }
}

/// Job handler that runs a saga's workflow to a terminal result.
pub struct RunWorkflowJob {
    engine: Arc<SagaEngine>,
}

impl RunWorkflowJob {
    /// Wraps the engine for registration under [`RUN_WORKFLOW_HANDLER`].
    pub fn new(engine: Arc<SagaEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for RunWorkflowJob {
    async fn run(&self, args: serde_json::Value) -> std::result::Result<serde_json::Value, JobError> {
        let args: RunWorkflowArgs =
            serde_json::from_value(args).map_err(|e| JobError::new(e.to_string()))?;
        let executor = self
            .engine
            .executors
            .get(&args.saga_type)
            .cloned()
            .ok_or_else(|| JobError::new(format!("unknown saga type: {}", args.saga_type)))?;

        let workflow_id = SagaRecord::key(&args.saga_type, &args.saga_id);
        let result = self
            .engine
            .runner
            .run(&workflow_id, executor, args.args)
            .await
            .map_err(|e| JobError::new(e.to_string()))?;

        serde_json::to_value(&result).map_err(|e| JobError::new(e.to_string()))
    }
}

/// Completion handler that records the saga's terminal status.
pub struct SagaCompletion {
    engine: Arc<SagaEngine>,
}

impl SagaCompletion {
    /// Wraps the engine for registration under [`SAGA_COMPLETION_HANDLER`].
    pub fn new(engine: Arc<SagaEngine>) -> Self {
        Self { engine }
    }

    async fn record(&self, context: CompletionContext, signal: CompletionSignal) -> Result<()> {
        let saga_type = context.saga_type.as_str();
        let saga_id = context.saga_id.as_str();

        match signal {
            CompletionSignal::Success { return_value } => {
                match serde_json::from_value::<WorkflowResult>(return_value)? {
                    WorkflowResult::Completed => {
                        self.engine
                            .sagas
                            .transition(saga_type, saga_id, SagaStatus::Completed, None)
                            .await?;
                        self.observe_duration(saga_type, saga_id).await?;
                        metrics::counter!(
                            "sagas_completed_total",
                            "saga_type" => saga_type.to_string()
                        )
                        .increment(1);
                    }
                    WorkflowResult::Compensated { reason } => {
                        // Walk the row through the compensation chain so
                        // that every observed status is a legal one.
                        self.engine
                            .sagas
                            .transition(saga_type, saga_id, SagaStatus::Failed, Some(&reason))
                            .await?;
                        self.engine
                            .sagas
                            .transition(saga_type, saga_id, SagaStatus::Compensating, None)
                            .await?;
                        self.engine
                            .sagas
                            .transition(saga_type, saga_id, SagaStatus::Compensated, None)
                            .await?;
                        metrics::counter!(
                            "sagas_compensated_total",
                            "saga_type" => saga_type.to_string()
                        )
                        .increment(1);
                    }
                    WorkflowResult::Canceled => {
                        self.engine
                            .sagas
                            .transition(saga_type, saga_id, SagaStatus::Failed, Some("canceled"))
                            .await?;
                    }
                }
            }
            CompletionSignal::Failed { error, attempts } => {
                tracing::error!(saga_type, saga_id, error, attempts, "saga workflow failed");
                self.engine
                    .sagas
                    .transition(saga_type, saga_id, SagaStatus::Failed, Some(&error))
                    .await?;
            }
            CompletionSignal::Canceled => {
                self.engine
                    .sagas
                    .transition(saga_type, saga_id, SagaStatus::Failed, Some("work canceled"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn observe_duration(&self, saga_type: &str, saga_id: &str) -> Result<()> {
        if let Some(record) = self.engine.sagas.get(saga_type, saga_id).await? {
            if let Some(completed_at) = record.completed_at {
                let elapsed = (completed_at - record.created_at)
                    .to_std()
                    .unwrap_or_default();
                metrics::histogram!(
                    "saga_duration_seconds",
                    "saga_type" => saga_type.to_string()
                )
                .record(elapsed.as_secs_f64());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionHandler for SagaCompletion {
    async fn on_complete(&self, signal: CompletionSignal, context: serde_json::Value) {
        let context: CompletionContext = match serde_json::from_value(context) {
            Ok(context) => context,
            Err(error) => {
                tracing::error!(%error, "malformed saga completion context");
                return;
            }
        };
        if let Err(error) = self.record(context, signal).await {
            tracing::error!(%error, "failed to record saga completion");
        }
    }
}
