//! Command outcomes and the journal backing the duplicate check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{CommandId, EventId, WorkId};
use serde::{Deserialize, Serialize};
use store::{collections, InsertOutcome, TransactionalStore, Version};

use crate::error::Result;

/// The result of executing a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The decision succeeded; its event and state update are durable.
    Success {
        /// The recorded event.
        event_id: EventId,
        /// The scope's version after the commit.
        version: Version,
        /// Caller-facing result data from the decider.
        data: serde_json::Value,
    },

    /// The decider recorded a business failure as a domain fact. The
    /// failure event is durable; this is not a rejection.
    Failed {
        /// The recorded failure event.
        event_id: EventId,
        /// The scope's version after the commit.
        version: Version,
        /// The business failure reason.
        error: String,
    },

    /// Deterministic refusal; nothing was recorded.
    Rejected {
        /// Machine-readable rejection code.
        code: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A prior execution with the same command ID already concluded; its
    /// recorded outcome is returned without re-running the decider.
    Duplicate {
        /// The outcome of the original execution.
        outcome: Box<CommandOutcome>,
    },

    /// A version conflict was detected and a retry has been scheduled on
    /// the scope's partition. The command will conclude asynchronously.
    Deferred {
        /// The queued retry's work ID.
        work_id: WorkId,
        /// The attempt number the retry will run as.
        retry_attempt: u32,
        /// The backoff delay applied.
        scheduled_after_ms: u64,
    },
}

impl CommandOutcome {
    /// Whether this outcome is terminal and belongs in the journal.
    /// Deferred executions conclude later under the same command ID;
    /// journaling them would make the retry observe itself as a
    /// duplicate.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandOutcome::Deferred { .. })
    }
}

/// A journaled command outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedOutcome {
    /// The command this outcome belongs to.
    pub command_id: CommandId,

    /// The terminal outcome.
    pub outcome: CommandOutcome,

    /// When the outcome was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Journal of terminal command outcomes, keyed by command ID. Backs the
/// orchestrator's duplicate check.
#[derive(Clone)]
pub struct OutcomeJournal {
    store: Arc<dyn TransactionalStore>,
}

impl OutcomeJournal {
    /// Creates a journal over the given store.
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self { store }
    }

    /// Records a terminal outcome. First writer wins; a concurrent
    /// duplicate execution that lost the race keeps the original record.
    pub async fn record(&self, command_id: &CommandId, outcome: &CommandOutcome) -> Result<()> {
        debug_assert!(outcome.is_terminal());
        let recorded = RecordedOutcome {
            command_id: command_id.clone(),
            outcome: outcome.clone(),
            recorded_at: Utc::now(),
        };
        match self
            .store
            .insert(
                collections::COMMAND_OUTCOMES,
                command_id.as_str(),
                serde_json::to_value(&recorded)?,
            )
            .await?
        {
            InsertOutcome::Inserted => {}
            InsertOutcome::Exists(_) => {
                tracing::debug!(command_id = %command_id, "outcome already journaled");
            }
        }
        Ok(())
    }

    /// Looks up the journaled outcome for a command ID.
    pub async fn get(&self, command_id: &CommandId) -> Result<Option<RecordedOutcome>> {
        match self
            .store
            .read(collections::COMMAND_OUTCOMES, command_id.as_str())
            .await?
        {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }
}
