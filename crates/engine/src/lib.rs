//! Command execution engine.
//!
//! The orchestrator runs a command end to end: duplicate check against
//! the outcome journal, middleware pipeline, decider invocation, and the
//! atomic dual write (state update + event append) against the store.
//! Optimistic-concurrency conflicts never surface to the caller as
//! errors: the retry engine re-enqueues the command on a per-scope FIFO
//! partition with exponential backoff, and the caller sees `Deferred` or,
//! after exhaustion, `Rejected`.

pub mod backoff;
pub mod error;
pub mod middleware;
pub mod orchestrator;
pub mod outcome;
pub mod registry;
pub mod retry;
pub mod scope;

pub use backoff::{delay, Jitter};
pub use error::{EngineError, Result};
pub use middleware::{
    priority, Middleware, MiddlewarePipeline, MiddlewareVerdict, RequestLogging, SchemaValidation,
};
pub use orchestrator::{CommandOrchestrator, DownstreamSpec, ExecuteCommandJob};
pub use outcome::{CommandOutcome, OutcomeJournal, RecordedOutcome};
pub use registry::{
    Command, Decider, DeciderContext, DeciderRegistration, DeciderRegistry, Decision, EventDraft,
};
pub use retry::{
    RetryArgs, RetryEngine, RetryPolicy, DCB_MAX_RETRIES_EXCEEDED, EXECUTE_COMMAND_HANDLER,
};
pub use scope::ScopeKey;

pub use store::{append_idempotent, AppendReceipt, AppendStatus};
