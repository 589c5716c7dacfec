//! Transactional store abstraction for the command execution engine.
//!
//! This crate provides:
//! - The [`TransactionalStore`] trait: versioned document reads, CAS writes,
//!   secondary-key lookup, and an append-only event log guarded by
//!   idempotency keys
//! - The atomic dual-write [`TransactionalStore::commit`] used by the
//!   command orchestrator (state update + event append, both or neither)
//! - [`append_idempotent`], the read-check-then-insert append helper
//! - An in-memory implementation for tests and a PostgreSQL implementation
//!   for production

pub mod append;
pub mod collections;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use common::{CommandId, CorrelationId, EventId, TenantId, WorkId};

pub use append::{AppendReceipt, AppendStatus, append_idempotent};
pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use record::{EventRecord, EventRecordBuilder};
pub use store::{
    AppendOutcome, CommitOutcome, InsertOutcome, TransactionalStore, Version, VersionedDoc,
    WriteOutcome,
};
