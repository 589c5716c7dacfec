//! Saga status rows.
//!
//! Exactly one row exists per `(saga_type, saga_id)`. Transitions are
//! version-guarded and restricted to the table in [`SagaStatus`]; rows
//! for terminal sagas are removed only by the retention cleanup.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};
use store::{collections, InsertOutcome, TransactionalStore, WriteOutcome};

use crate::error::Result;
use crate::status::SagaStatus;

/// One saga instance's status row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The saga definition this instance runs (e.g. `order_fulfillment`).
    pub saga_type: String,

    /// The business key (e.g. the order ID).
    pub saga_id: String,

    /// The underlying workflow execution.
    pub workflow_id: String,

    /// Current status.
    pub status: SagaStatus,

    /// The event that triggered the saga, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_event_id: Option<EventId>,

    /// When the saga was created.
    pub created_at: DateTime<Utc>,

    /// When the status last changed.
    pub updated_at: DateTime<Utc>,

    /// When the saga reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// The most recent failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SagaRecord {
    /// The row key: `{saga_type}:{saga_id}`.
    pub fn key(saga_type: &str, saga_id: &str) -> String {
        format!("{saga_type}:{saga_id}")
    }
}

/// Outcome of [`SagaStore::create`].
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// A fresh `pending` row was created.
    Created(SagaRecord),

    /// A row already exists for this `(saga_type, saga_id)`.
    Exists(SagaRecord),
}

/// Outcome of [`SagaStore::transition`].
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The transition was applied.
    Transitioned(SagaRecord),

    /// The transition is not allowed from the row's current status.
    Invalid {
        /// The status the row holds.
        from: SagaStatus,
    },

    /// No row exists for this `(saga_type, saga_id)`.
    NotFound,
}

/// Persistence for saga status rows.
#[derive(Clone)]
pub struct SagaStore {
    store: Arc<dyn TransactionalStore>,
}

impl SagaStore {
    /// Creates a saga store.
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self { store }
    }

    /// Creates a `pending` row. Uniqueness per `(saga_type, saga_id)` is
    /// guarded by the insert; a concurrent starter observes `Exists`.
    pub async fn create(
        &self,
        saga_type: &str,
        saga_id: &str,
        workflow_id: &str,
        trigger_event_id: Option<EventId>,
    ) -> Result<CreateOutcome> {
        let now = Utc::now();
        let record = SagaRecord {
            saga_type: saga_type.to_string(),
            saga_id: saga_id.to_string(),
            workflow_id: workflow_id.to_string(),
            status: SagaStatus::Pending,
            trigger_event_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        };

        match self
            .store
            .insert(
                collections::SAGAS,
                &SagaRecord::key(saga_type, saga_id),
                serde_json::to_value(&record)?,
            )
            .await?
        {
            InsertOutcome::Inserted => Ok(CreateOutcome::Created(record)),
            InsertOutcome::Exists(doc) => Ok(CreateOutcome::Exists(doc.decode()?)),
        }
    }

    /// Applies a status transition, restricted to the allowed table.
    pub async fn transition(
        &self,
        saga_type: &str,
        saga_id: &str,
        to: SagaStatus,
        error: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let key = SagaRecord::key(saga_type, saga_id);
        loop {
            let Some(doc) = self.store.read(collections::SAGAS, &key).await? else {
                return Ok(TransitionOutcome::NotFound);
            };

            let mut record: SagaRecord = doc.decode()?;
            if !record.status.can_transition_to(to) {
                return Ok(TransitionOutcome::Invalid {
                    from: record.status,
                });
            }

            record.status = to;
            record.updated_at = Utc::now();
            if let Some(error) = error {
                record.error = Some(error.to_string());
            }
            if to.is_terminal() {
                record.completed_at = Some(record.updated_at);
            }

            match self
                .store
                .write_if(
                    collections::SAGAS,
                    &key,
                    doc.version,
                    serde_json::to_value(&record)?,
                )
                .await?
            {
                WriteOutcome::Written(_) => {
                    tracing::info!(saga_type, saga_id, status = %to, "saga transitioned");
                    return Ok(TransitionOutcome::Transitioned(record));
                }
                WriteOutcome::Conflict { .. } => continue,
            }
        }
    }

    /// Looks up a saga row.
    pub async fn get(&self, saga_type: &str, saga_id: &str) -> Result<Option<SagaRecord>> {
        match self
            .store
            .read(collections::SAGAS, &SagaRecord::key(saga_type, saga_id))
            .await?
        {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    /// Lists rows with the given status.
    pub async fn list_by_status(&self, status: SagaStatus) -> Result<Vec<SagaRecord>> {
        let docs = self
            .store
            .find_by_field(collections::SAGAS, "status", status.as_str())
            .await?;
        docs.iter().map(|doc| Ok(doc.decode()?)).collect()
    }

    /// Deletes terminal rows whose `completed_at` is older than the
    /// cutoff. Events are never touched; this prunes status rows only.
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let docs = self.store.scan(collections::SAGAS).await?;
        let mut removed = 0u64;
        for doc in docs {
            let record: SagaRecord = doc.decode()?;
            let expired = record
                .completed_at
                .map(|at| at < older_than)
                .unwrap_or(false);
            if record.status.is_terminal() && expired {
                if self.store.delete(collections::SAGAS, &doc.key).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
