//! Job-dispatch substrate for asynchronous downstream work.
//!
//! Work is modeled as data: a handler ID plus JSON args, resolved through
//! an explicit [`HandlerRegistry`] at execution time. Completion signals
//! (`success | failed | canceled`) are delivered to a registered completion
//! handler; they may be redelivered, so consumers must be idempotent.
//!
//! [`LocalDispatcher`] provides independent bounded-parallelism pools per
//! workload class and strict FIFO lanes per partition key, so that two
//! units of work sharing a partition never execute concurrently.

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod job;
pub mod local;

pub use common::WorkId;

pub use dispatcher::JobDispatcher;
pub use error::{DispatchError, Result};
pub use handler::{CompletionHandler, HandlerRegistry, JobError, JobHandler};
pub use job::{CompletionSignal, CompletionTarget, EnqueueOptions, JobSpec, WorkloadClass};
pub use local::{DispatcherConfig, LocalDispatcher, PoolConfig};
