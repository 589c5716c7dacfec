//! Saga engine: durable multi-step business transactions with a single
//! compensation path.
//!
//! A saga is a fixed, hand-written sequence of orchestrated commands.
//! Step progress is checkpointed by the workflow runner, so a restart
//! resumes from the last completed step; the saga status row is the
//! system of record for *status* and is only updated through the
//! workflow's completion callback, never mid-execution.

pub mod engine;
pub mod error;
pub mod order_fulfillment;
pub mod record;
pub mod status;
pub mod workflow;

pub use engine::{
    RunWorkflowJob, SagaCompletion, SagaEngine, StartOutcome, RUN_WORKFLOW_HANDLER,
    SAGA_COMPLETION_HANDLER,
};
pub use error::{Result, SagaError};
pub use order_fulfillment::{FulfillmentArgs, OrderFulfillmentExecutor, ORDER_FULFILLMENT};
pub use record::{CreateOutcome, SagaRecord, SagaStore, TransitionOutcome};
pub use status::SagaStatus;
pub use workflow::{
    DurableWorkflowRunner, StepDisposition, StepExecutor, WorkflowResult, WorkflowRunner,
};
