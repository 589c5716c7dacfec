//! Command orchestrator.
//!
//! Runs a command end to end: duplicate check, middleware, decider, the
//! atomic dual write (state update + event append), downstream job
//! enqueue, and outcome journaling. Version conflicts are handed to the
//! retry engine and come back as `Deferred` or an exhausted `Rejected`.

use std::sync::Arc;

use async_trait::async_trait;
use dispatch::{
    CompletionTarget, EnqueueOptions, JobDispatcher, JobError, JobHandler, JobSpec, WorkloadClass,
};
use durability::DEAD_LETTER_HANDLER;
use store::{collections, AppendOutcome, CommitOutcome, EventRecord, TransactionalStore, Version};

use crate::error::{EngineError, Result};
use crate::middleware::{MiddlewarePipeline, MiddlewareVerdict, RequestLogging, SchemaValidation};
use crate::outcome::{CommandOutcome, OutcomeJournal};
use crate::registry::{Command, Decider, DeciderContext, DeciderRegistry, Decision, EventDraft};
use crate::retry::{RetryArgs, RetryEngine, RetryPolicy};
use crate::scope::ScopeKey;

/// A downstream processing stage enqueued for every committed event.
#[derive(Debug, Clone)]
pub struct DownstreamSpec {
    /// Correlation-key prefix and log label (e.g. `projection`).
    pub kind: String,

    /// The job handler to enqueue.
    pub handler_id: String,

    /// The pool the work runs under.
    pub class: WorkloadClass,
}

impl DownstreamSpec {
    /// Creates a downstream spec.
    pub fn new(
        kind: impl Into<String>,
        handler_id: impl Into<String>,
        class: WorkloadClass,
    ) -> Self {
        Self {
            kind: kind.into(),
            handler_id: handler_id.into(),
            class,
        }
    }
}

/// The command orchestrator.
pub struct CommandOrchestrator {
    store: Arc<dyn TransactionalStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    registry: Arc<DeciderRegistry>,
    middleware: MiddlewarePipeline,
    retry: RetryEngine,
    journal: OutcomeJournal,
    downstreams: Vec<DownstreamSpec>,
}

impl CommandOrchestrator {
    /// Creates an orchestrator with the default middleware (schema
    /// validation + request logging), retry policy, and downstream stages
    /// (projection application + cross-context publication).
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        registry: Arc<DeciderRegistry>,
    ) -> Self {
        let mut middleware = MiddlewarePipeline::new();
        middleware.add(Box::new(SchemaValidation));
        middleware.add(Box::new(RequestLogging));

        Self {
            journal: OutcomeJournal::new(Arc::clone(&store)),
            retry: RetryEngine::new(Arc::clone(&dispatcher), RetryPolicy::default()),
            store,
            dispatcher,
            registry,
            middleware,
            downstreams: vec![
                DownstreamSpec::new("projection", "projection.apply", WorkloadClass::Projection),
                DownstreamSpec::new(
                    "integration",
                    "integration.publish",
                    WorkloadClass::Integration,
                ),
            ],
        }
    }

    /// Replaces the middleware pipeline.
    pub fn with_middleware(mut self, middleware: MiddlewarePipeline) -> Self {
        self.middleware = middleware;
        self
    }

    /// Replaces the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryEngine::new(Arc::clone(&self.dispatcher), policy);
        self
    }

    /// Replaces the downstream stages.
    pub fn with_downstreams(mut self, downstreams: Vec<DownstreamSpec>) -> Self {
        self.downstreams = downstreams;
        self
    }

    /// Executes a command.
    #[tracing::instrument(skip(self, command), fields(command_id = %command.command_id, command_type = %command.command_type))]
    pub async fn execute(&self, command: Command) -> Result<CommandOutcome> {
        self.execute_attempt(command, 0).await
    }

    /// Executes a command as a specific attempt. Attempt numbers above 0
    /// come from the retry engine's re-invocations.
    pub async fn execute_attempt(&self, command: Command, attempt: u32) -> Result<CommandOutcome> {
        let started = std::time::Instant::now();

        // 1. Duplicate check: a concluded command never re-runs.
        if let Some(recorded) = self.journal.get(&command.command_id).await? {
            metrics::counter!("commands_executed_total", "outcome" => "duplicate").increment(1);
            return Ok(CommandOutcome::Duplicate {
                outcome: Box::new(recorded.outcome),
            });
        }

        // 2. Middleware, ascending priority. Rejections here are not
        // journaled: nothing ran, so a corrected resubmission under the
        // same ID must be allowed to execute.
        if let MiddlewareVerdict::Reject { code, reason } = self.middleware.run(&command).await {
            metrics::counter!("commands_executed_total", "outcome" => "rejected").increment(1);
            return Ok(CommandOutcome::Rejected { code, reason });
        }

        let registration = self
            .registry
            .get(&command.command_type)
            .ok_or_else(|| EngineError::UnknownCommandType(command.command_type.clone()))?;

        let scope = registration.scope_key(&command);
        let stream_id = registration.stream_id(&command);
        let ctx = DeciderContext {
            tenant: command.tenant.clone(),
            scope: scope.clone(),
            correlation_id: command.correlation_id.clone(),
        };

        // 3. Decide against the scope's current materialized state,
        // rebuilding it from the stream when the document is missing.
        let (state, version) = self
            .load_state(&scope, registration.decider(), registration.stream_type(), &stream_id)
            .await?;
        let decision = registration.decider().decide(state.as_ref(), &command, &ctx);

        let outcome = match decision {
            Decision::Rejected { code, reason } => {
                let outcome = CommandOutcome::Rejected { code, reason };
                self.journal.record(&command.command_id, &outcome).await?;
                metrics::counter!("commands_executed_total", "outcome" => "rejected").increment(1);
                outcome
            }
            Decision::Success { event, state, data } => {
                self.commit_decision(
                    &command, registration.stream_type(), registration.bounded_context(),
                    &stream_id, &scope, attempt, version, event, state,
                    CommitKind::Success { data },
                )
                .await?
            }
            Decision::Failed { event, state, error } => {
                self.commit_decision(
                    &command, registration.stream_type(), registration.bounded_context(),
                    &stream_id, &scope, attempt, version, event, state,
                    CommitKind::Failed { error },
                )
                .await?
            }
        };

        metrics::histogram!("command_execution_seconds").record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    /// 4-6. Dual write, downstream enqueue, outcome journaling.
    #[allow(clippy::too_many_arguments)]
    async fn commit_decision(
        &self,
        command: &Command,
        stream_type: &str,
        bounded_context: &str,
        stream_id: &str,
        scope: &ScopeKey,
        attempt: u32,
        expected: Version,
        event: EventDraft,
        state: serde_json::Value,
        kind: CommitKind,
    ) -> Result<CommandOutcome> {
        let record = EventRecord::builder()
            .idempotency_key(format!("cmd:{}", command.command_id))
            .stream_type(stream_type)
            .stream_id(stream_id)
            .event_type(event.event_type)
            .payload_raw(event.payload)
            .bounded_context(bounded_context)
            .build();

        match self
            .store
            .commit(&scope.to_string(), expected, state, record.clone())
            .await?
        {
            CommitOutcome::Committed { version, append } => {
                // A duplicate append means an earlier delivery already
                // committed this command and lost a later step (the
                // downstream enqueue or the journal write). The store
                // skipped the state write, so this attempt's re-derived
                // data is stale; rebuild the outcome from the recorded
                // event and repair the journal.
                if let AppendOutcome::Duplicate(event_id) = append {
                    let recorded = self
                        .store
                        .event_by_idempotency_key(&record.idempotency_key)
                        .await?;
                    if let Some(recorded) = &recorded {
                        self.enqueue_downstream(recorded, event_id).await?;
                    }
                    let outcome = match kind {
                        CommitKind::Success { .. } => CommandOutcome::Success {
                            event_id,
                            version,
                            data: recorded.map_or(serde_json::Value::Null, |e| e.payload),
                        },
                        CommitKind::Failed { error } => {
                            CommandOutcome::Failed { event_id, version, error }
                        }
                    };
                    self.journal.record(&command.command_id, &outcome).await?;
                    metrics::counter!("commands_executed_total", "outcome" => "duplicate")
                        .increment(1);
                    return Ok(CommandOutcome::Duplicate { outcome: Box::new(outcome) });
                }

                let event_id = append.event_id();
                self.enqueue_downstream(&record, event_id).await?;

                let outcome = match kind {
                    CommitKind::Success { data } => {
                        metrics::counter!("commands_executed_total", "outcome" => "success")
                            .increment(1);
                        CommandOutcome::Success { event_id, version, data }
                    }
                    CommitKind::Failed { error } => {
                        metrics::counter!("commands_executed_total", "outcome" => "failed")
                            .increment(1);
                        CommandOutcome::Failed { event_id, version, error }
                    }
                };
                self.journal.record(&command.command_id, &outcome).await?;
                Ok(outcome)
            }
            CommitOutcome::Conflict { actual } => {
                let outcome = self
                    .retry
                    .handle_conflict(command, scope, attempt, actual)
                    .await?;
                if outcome.is_terminal() {
                    self.journal.record(&command.command_id, &outcome).await?;
                }
                Ok(outcome)
            }
        }
    }

    async fn load_state(
        &self,
        scope: &ScopeKey,
        decider: &dyn Decider,
        stream_type: &str,
        stream_id: &str,
    ) -> Result<(Option<serde_json::Value>, Version)> {
        if let Some(doc) = self.store.read(collections::SCOPES, &scope.to_string()).await? {
            return Ok((Some(doc.value.clone()), doc.version));
        }

        // No materialized state yet. Fold the stream, if any, so a scope
        // whose document was lost (or never written) still decides
        // against its full history. The version stays 0: the first commit
        // recreates the document.
        let events = self.store.events_for_stream(stream_type, stream_id).await?;
        if events.is_empty() {
            return Ok((None, Version::initial()));
        }
        let mut state = None;
        for event in &events {
            state = Some(decider.evolve(state, event));
        }
        Ok((state, Version::initial()))
    }

    async fn enqueue_downstream(&self, record: &EventRecord, event_id: common::EventId) -> Result<()> {
        let event_json = serde_json::to_value(record)?;
        for spec in &self.downstreams {
            let correlation_key = format!(
                "{}:{}:{}:{}",
                spec.kind, record.stream_type, record.stream_id, event_id
            );
            self.dispatcher
                .enqueue(
                    JobSpec::new(&spec.handler_id, event_json.clone()),
                    EnqueueOptions::class(spec.class).on_complete(CompletionTarget::new(
                        DEAD_LETTER_HANDLER,
                        serde_json::json!({ "correlation_key": correlation_key }),
                    )),
                )
                .await?;
        }
        Ok(())
    }
}

enum CommitKind {
    Success { data: serde_json::Value },
    Failed { error: String },
}

/// Job adapter re-invoking the orchestrator for deferred retries.
/// Registered under [`crate::EXECUTE_COMMAND_HANDLER`].
pub struct ExecuteCommandJob {
    orchestrator: Arc<CommandOrchestrator>,
}

impl ExecuteCommandJob {
    /// Creates the adapter.
    pub fn new(orchestrator: Arc<CommandOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for ExecuteCommandJob {
    async fn run(&self, args: serde_json::Value) -> std::result::Result<serde_json::Value, JobError> {
        let args: RetryArgs =
            serde_json::from_value(args).map_err(|e| JobError::new(e.to_string()))?;

        let outcome = self
            .orchestrator
            .execute_attempt(args.command, args.attempt)
            .await
            .map_err(|e| JobError::new(e.to_string()))?;

        serde_json::to_value(&outcome).map_err(|e| JobError::new(e.to_string()))
    }
}
