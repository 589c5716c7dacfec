//! Shared identifier newtypes used across the command execution engine.

pub mod types;

pub use types::{CommandId, CorrelationId, EventId, TenantId, WorkId};
