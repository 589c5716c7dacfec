use async_trait::async_trait;
use common::WorkId;

use crate::error::Result;
use crate::job::{EnqueueOptions, JobSpec};

/// The dispatch seam consumed by the orchestrator, retry engine, and saga
/// engine.
///
/// `enqueue` returns as soon as the work is queued; execution, infra-level
/// retry, and completion delivery happen asynchronously. Completion signals
/// are at-most-once-effectively: they may be redelivered, and consumers
/// must be idempotent.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Queues a unit of work.
    async fn enqueue(&self, job: JobSpec, options: EnqueueOptions) -> Result<WorkId>;
}
