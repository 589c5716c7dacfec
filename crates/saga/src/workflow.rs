//! Durable step-sequence execution.
//!
//! The runner drives an executor's steps in order, checkpointing each
//! completed step before starting the next. A restarted run skips
//! already-checkpointed steps, which is why steps must be idempotent at
//! the command level. When a step asks for compensation, the executor's
//! compensation branch runs once with the list of completed steps.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use store::{collections, InsertOutcome, TransactionalStore, WriteOutcome};

use crate::error::Result;

/// What a forward step decided.
#[derive(Debug, Clone, PartialEq)]
pub enum StepDisposition {
    /// Step done; continue with the next one.
    Continue,

    /// Step observed a business failure; stop and compensate.
    Compensate {
        /// The failure reason, carried into the compensation commands.
        reason: String,
    },
}

/// Terminal result of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WorkflowResult {
    /// All steps completed.
    Completed,

    /// A step failed and compensation concluded.
    Compensated {
        /// The reason the forward sequence stopped.
        reason: String,
    },

    /// The run was canceled before finishing.
    Canceled,
}

/// The fixed step sequence and compensation branch of one saga type.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Forward step names, in execution order.
    fn steps(&self) -> &[&str];

    /// Runs one forward step.
    async fn run_step(&self, step: &str, args: &serde_json::Value) -> Result<StepDisposition>;

    /// Runs the compensation branch. `completed` holds the forward steps
    /// that finished, in execution order.
    async fn compensate(
        &self,
        completed: &[String],
        reason: &str,
        args: &serde_json::Value,
    ) -> Result<()>;
}

/// The workflow substrate contract consumed by the saga engine.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Runs (or resumes) a workflow to a terminal result.
    async fn run(
        &self,
        workflow_id: &str,
        executor: Arc<dyn StepExecutor>,
        args: serde_json::Value,
    ) -> Result<WorkflowResult>;

    /// Requests cancellation. Best effort: a run checks the flag between
    /// steps.
    async fn cancel(&self, workflow_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    workflow_id: String,
    completed_steps: Vec<String>,
    canceled: bool,
}

impl Checkpoint {
    fn new(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            completed_steps: Vec::new(),
            canceled: false,
        }
    }
}

/// Store-backed runner. Checkpoints survive a process restart; resuming
/// a workflow re-runs nothing that already completed.
#[derive(Clone)]
pub struct DurableWorkflowRunner {
    store: Arc<dyn TransactionalStore>,
}

impl DurableWorkflowRunner {
    /// Creates a runner over the given store.
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self { store }
    }

    async fn load_or_create(&self, workflow_id: &str) -> Result<(Checkpoint, store::Version)> {
        if let Some(doc) = self.store.read(collections::WORKFLOWS, workflow_id).await? {
            return Ok((doc.decode()?, doc.version));
        }

        let checkpoint = Checkpoint::new(workflow_id);
        match self
            .store
            .insert(
                collections::WORKFLOWS,
                workflow_id,
                serde_json::to_value(&checkpoint)?,
            )
            .await?
        {
            InsertOutcome::Inserted => Ok((checkpoint, store::Version::first())),
            InsertOutcome::Exists(doc) => {
                let checkpoint = doc.decode()?;
                Ok((checkpoint, doc.version))
            }
        }
    }

    async fn save(
        &self,
        workflow_id: &str,
        checkpoint: &Checkpoint,
        version: store::Version,
    ) -> Result<store::Version> {
        match self
            .store
            .write_if(
                collections::WORKFLOWS,
                workflow_id,
                version,
                serde_json::to_value(checkpoint)?,
            )
            .await?
        {
            WriteOutcome::Written(next) => Ok(next),
            // One workflow is driven by one runner at a time; a conflict
            // means a concurrent cancel touched the document. Re-read and
            // retry the write.
            WriteOutcome::Conflict { .. } => {
                let doc = self
                    .store
                    .read(collections::WORKFLOWS, workflow_id)
                    .await?
                    .map(|d| d.version)
                    .unwrap_or(store::Version::initial());
                match self
                    .store
                    .write_if(
                        collections::WORKFLOWS,
                        workflow_id,
                        doc,
                        serde_json::to_value(checkpoint)?,
                    )
                    .await?
                {
                    WriteOutcome::Written(next) => Ok(next),
                    WriteOutcome::Conflict { actual } => Ok(actual),
                }
            }
        }
    }

    async fn is_canceled(&self, workflow_id: &str) -> Result<bool> {
        match self.store.read(collections::WORKFLOWS, workflow_id).await? {
            Some(doc) => {
                let checkpoint: Checkpoint = doc.decode()?;
                Ok(checkpoint.canceled)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl WorkflowRunner for DurableWorkflowRunner {
    #[tracing::instrument(skip(self, executor, args))]
    async fn run(
        &self,
        workflow_id: &str,
        executor: Arc<dyn StepExecutor>,
        args: serde_json::Value,
    ) -> Result<WorkflowResult> {
        let (mut checkpoint, mut version) = self.load_or_create(workflow_id).await?;

        for step in executor.steps() {
            if checkpoint.completed_steps.iter().any(|s| s == step) {
                tracing::debug!(workflow_id, step, "step already checkpointed, skipping");
                continue;
            }
            if self.is_canceled(workflow_id).await? {
                tracing::warn!(workflow_id, "workflow canceled");
                return Ok(WorkflowResult::Canceled);
            }

            match executor.run_step(step, &args).await? {
                StepDisposition::Continue => {
                    checkpoint.completed_steps.push(step.to_string());
                    version = self.save(workflow_id, &checkpoint, version).await?;
                    tracing::info!(workflow_id, step, "step completed");
                }
                StepDisposition::Compensate { reason } => {
                    tracing::warn!(workflow_id, step, reason, "step failed, compensating");
                    executor
                        .compensate(&checkpoint.completed_steps, &reason, &args)
                        .await?;
                    return Ok(WorkflowResult::Compensated { reason });
                }
            }
        }

        Ok(WorkflowResult::Completed)
    }

    async fn cancel(&self, workflow_id: &str) -> Result<()> {
        loop {
            let Some(doc) = self.store.read(collections::WORKFLOWS, workflow_id).await? else {
                // Not started yet; pre-create a canceled checkpoint so a
                // late run sees the flag immediately.
                let mut checkpoint = Checkpoint::new(workflow_id);
                checkpoint.canceled = true;
                match self
                    .store
                    .insert(
                        collections::WORKFLOWS,
                        workflow_id,
                        serde_json::to_value(&checkpoint)?,
                    )
                    .await?
                {
                    InsertOutcome::Inserted => return Ok(()),
                    InsertOutcome::Exists(_) => continue,
                }
            };

            let mut checkpoint: Checkpoint = doc.decode()?;
            checkpoint.canceled = true;
            match self
                .store
                .write_if(
                    collections::WORKFLOWS,
                    workflow_id,
                    doc.version,
                    serde_json::to_value(&checkpoint)?,
                )
                .await?
            {
                WriteOutcome::Written(_) => return Ok(()),
                WriteOutcome::Conflict { .. } => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use store::InMemoryStore;

    /// Records step invocations; optionally errors once at a named step.
    struct ScriptedExecutor {
        invocations: Mutex<Vec<String>>,
        fail_once_at: Option<&'static str>,
        failed: AtomicBool,
        compensate_at: Option<&'static str>,
        compensations: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                invocations: Mutex::new(Vec::new()),
                fail_once_at: None,
                failed: AtomicBool::new(false),
                compensate_at: None,
                compensations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        fn steps(&self) -> &[&str] {
            &["alpha", "beta", "gamma"]
        }

        async fn run_step(&self, step: &str, _args: &serde_json::Value) -> Result<StepDisposition> {
            if self.fail_once_at == Some(step) && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(crate::SagaError::StepTimeout(step.to_string()));
            }
            self.invocations.lock().unwrap().push(step.to_string());
            if self.compensate_at == Some(step) {
                return Ok(StepDisposition::Compensate {
                    reason: format!("{step} refused"),
                });
            }
            Ok(StepDisposition::Continue)
        }

        async fn compensate(
            &self,
            completed: &[String],
            _reason: &str,
            _args: &serde_json::Value,
        ) -> Result<()> {
            self.compensations.lock().unwrap().push(completed.to_vec());
            Ok(())
        }
    }

    fn runner() -> DurableWorkflowRunner {
        DurableWorkflowRunner::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn all_steps_run_in_order() {
        let runner = runner();
        let executor = Arc::new(ScriptedExecutor::new());

        let result = runner
            .run("wf-1", executor.clone(), serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(result, WorkflowResult::Completed);
        assert_eq!(
            *executor.invocations.lock().unwrap(),
            vec!["alpha", "beta", "gamma"]
        );
    }

    #[tokio::test]
    async fn restart_resumes_after_the_last_checkpoint() {
        let runner = runner();
        let executor = Arc::new(ScriptedExecutor {
            fail_once_at: Some("beta"),
            ..ScriptedExecutor::new()
        });

        // First run checkpoints alpha, then dies at beta.
        let first = runner
            .run("wf-1", executor.clone(), serde_json::json!({}))
            .await;
        assert!(first.is_err());
        assert_eq!(*executor.invocations.lock().unwrap(), vec!["alpha"]);

        // The re-run skips alpha and finishes.
        let second = runner
            .run("wf-1", executor.clone(), serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(second, WorkflowResult::Completed);
        assert_eq!(
            *executor.invocations.lock().unwrap(),
            vec!["alpha", "beta", "gamma"]
        );
    }

    #[tokio::test]
    async fn compensation_receives_the_completed_steps() {
        let runner = runner();
        let executor = Arc::new(ScriptedExecutor {
            compensate_at: Some("beta"),
            ..ScriptedExecutor::new()
        });

        let result = runner
            .run("wf-1", executor.clone(), serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(
            result,
            WorkflowResult::Compensated {
                reason: "beta refused".to_string()
            }
        );
        let compensations = executor.compensations.lock().unwrap();
        assert_eq!(compensations.len(), 1);
        assert_eq!(compensations[0], vec!["alpha"]);
    }

    #[tokio::test]
    async fn cancel_before_start_stops_the_run_immediately() {
        let runner = runner();
        let executor = Arc::new(ScriptedExecutor::new());

        runner.cancel("wf-1").await.unwrap();
        let result = runner
            .run("wf-1", executor.clone(), serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(result, WorkflowResult::Canceled);
        assert!(executor.invocations.lock().unwrap().is_empty());
    }
}
