//! Dead-letter ledger for failed asynchronous work.
//!
//! Entries are keyed by correlation key and move through a bounded state
//! machine: `pending -> retrying -> {retried | ignored}`, with
//! `retrying -> pending` when a prepared retry itself fails. Terminal
//! entries are never resurrected by late callbacks and never deleted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch::{CompletionHandler, CompletionSignal};
use serde::{Deserialize, Serialize};
use store::{collections, TransactionalStore, WriteOutcome};

use crate::error::Result;

/// Completion-handler ID under which [`DeadLetterRecorder`] is registered.
pub const DEAD_LETTER_HANDLER: &str = "durability.dead_letter";

/// Lifecycle state of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Failed and awaiting review or retry.
    Pending,

    /// A retry has been prepared and re-enqueued.
    Retrying,

    /// The retry succeeded. Terminal.
    Retried,

    /// Manually closed without a retry. Terminal.
    Ignored,
}

impl DeadLetterStatus {
    /// Whether the status is terminal. Terminal entries ignore all further
    /// failure callbacks.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeadLetterStatus::Retried | DeadLetterStatus::Ignored)
    }
}

/// A durable record of a failed unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Identifies the unit of work (e.g. `projection:order:ORD-1:evt-id`).
    pub correlation_key: String,

    /// Number of observed failures, across original runs and retries.
    pub attempt_count: u32,

    /// Current lifecycle state.
    pub status: DeadLetterStatus,

    /// The most recent error message.
    pub error: String,

    /// When the most recent failure was observed.
    pub failed_at: DateTime<Utc>,

    /// Operator notes, set by [`DeadLetterLedger::ignore`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Outcome of [`DeadLetterLedger::record_failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFailureOutcome {
    /// The failure was recorded; the entry is now `pending` with this
    /// attempt count.
    Recorded {
        /// Total failures observed for this correlation key.
        attempt_count: u32,
    },

    /// The entry is terminal; the late callback was dropped.
    Closed {
        /// The terminal status the entry holds.
        status: DeadLetterStatus,
    },
}

/// Outcome of [`DeadLetterLedger::prepare_retry`].
#[derive(Debug, Clone)]
pub enum PrepareRetryOutcome {
    /// The entry moved to `retrying`; re-enqueue the work.
    Ready(DeadLetterEntry),

    /// The entry is not `pending` (already retrying or terminal).
    AlreadyProcessed {
        /// The status the entry holds.
        status: DeadLetterStatus,
    },

    /// No entry exists for this correlation key.
    NotFound,
}

/// Outcome of [`DeadLetterLedger::mark_retried`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkRetriedOutcome {
    /// The entry is now terminal `retried`.
    Marked,

    /// The entry was not in `retrying`; nothing changed.
    NotRetrying {
        /// The status the entry holds.
        status: DeadLetterStatus,
    },

    /// No entry exists for this correlation key.
    NotFound,
}

/// Outcome of [`DeadLetterLedger::ignore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreOutcome {
    /// The entry is now terminal `ignored`.
    Ignored,

    /// The entry was already terminal; nothing changed.
    AlreadyTerminal {
        /// The status the entry holds.
        status: DeadLetterStatus,
    },

    /// No entry exists for this correlation key.
    NotFound,
}

/// Counts returned by [`DeadLetterLedger::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub pending: u64,
    pub retrying: u64,
    pub retried: u64,
    pub ignored: u64,

    /// Entry counts by correlation-key prefix (the segment before the
    /// first `:`, e.g. `projection`, `integration`, `durable_append`).
    pub by_prefix: HashMap<String, u64>,
}

/// The dead-letter ledger.
///
/// All transitions run as read-modify-write loops guarded by the stored
/// document version, so concurrent callbacks for the same key serialize
/// instead of losing updates.
#[derive(Clone)]
pub struct DeadLetterLedger {
    store: Arc<dyn TransactionalStore>,
}

impl DeadLetterLedger {
    /// Creates a ledger over the given store.
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self { store }
    }

    /// Records a failure for a unit of work.
    ///
    /// Creates a `pending` entry on the first failure; increments the
    /// attempt count while `pending`; resets `retrying` back to `pending`
    /// (the retry itself failed). Terminal entries are left untouched.
    #[tracing::instrument(skip(self, error))]
    pub async fn record_failure(
        &self,
        correlation_key: &str,
        error: &str,
    ) -> Result<RecordFailureOutcome> {
        loop {
            let existing = self
                .store
                .read(collections::DEAD_LETTERS, correlation_key)
                .await?;

            let Some(doc) = existing else {
                let entry = DeadLetterEntry {
                    correlation_key: correlation_key.to_string(),
                    attempt_count: 1,
                    status: DeadLetterStatus::Pending,
                    error: error.to_string(),
                    failed_at: Utc::now(),
                    notes: None,
                };
                match self
                    .store
                    .insert(
                        collections::DEAD_LETTERS,
                        correlation_key,
                        serde_json::to_value(&entry)?,
                    )
                    .await?
                {
                    store::InsertOutcome::Inserted => {
                        metrics::counter!("dead_letters_recorded").increment(1);
                        tracing::warn!(correlation_key, error, "dead letter recorded");
                        return Ok(RecordFailureOutcome::Recorded { attempt_count: 1 });
                    }
                    // Lost a race with another callback; re-read.
                    store::InsertOutcome::Exists(_) => continue,
                }
            };

            let mut entry: DeadLetterEntry = doc.decode()?;
            match entry.status {
                DeadLetterStatus::Pending => {
                    entry.attempt_count += 1;
                }
                DeadLetterStatus::Retrying => {
                    entry.status = DeadLetterStatus::Pending;
                    entry.attempt_count += 1;
                }
                status => return Ok(RecordFailureOutcome::Closed { status }),
            }
            entry.error = error.to_string();
            entry.failed_at = Utc::now();

            match self
                .store
                .write_if(
                    collections::DEAD_LETTERS,
                    correlation_key,
                    doc.version,
                    serde_json::to_value(&entry)?,
                )
                .await?
            {
                WriteOutcome::Written(_) => {
                    metrics::counter!("dead_letters_recorded").increment(1);
                    return Ok(RecordFailureOutcome::Recorded {
                        attempt_count: entry.attempt_count,
                    });
                }
                WriteOutcome::Conflict { .. } => continue,
            }
        }
    }

    /// Moves a `pending` entry to `retrying` and returns it so the caller
    /// can re-enqueue the unit of work.
    pub async fn prepare_retry(&self, correlation_key: &str) -> Result<PrepareRetryOutcome> {
        loop {
            let Some(doc) = self
                .store
                .read(collections::DEAD_LETTERS, correlation_key)
                .await?
            else {
                return Ok(PrepareRetryOutcome::NotFound);
            };

            let mut entry: DeadLetterEntry = doc.decode()?;
            if entry.status != DeadLetterStatus::Pending {
                return Ok(PrepareRetryOutcome::AlreadyProcessed {
                    status: entry.status,
                });
            }
            entry.status = DeadLetterStatus::Retrying;

            match self
                .store
                .write_if(
                    collections::DEAD_LETTERS,
                    correlation_key,
                    doc.version,
                    serde_json::to_value(&entry)?,
                )
                .await?
            {
                WriteOutcome::Written(_) => return Ok(PrepareRetryOutcome::Ready(entry)),
                WriteOutcome::Conflict { .. } => continue,
            }
        }
    }

    /// Marks a `retrying` entry as terminal `retried`.
    pub async fn mark_retried(&self, correlation_key: &str) -> Result<MarkRetriedOutcome> {
        loop {
            let Some(doc) = self
                .store
                .read(collections::DEAD_LETTERS, correlation_key)
                .await?
            else {
                return Ok(MarkRetriedOutcome::NotFound);
            };

            let mut entry: DeadLetterEntry = doc.decode()?;
            if entry.status != DeadLetterStatus::Retrying {
                return Ok(MarkRetriedOutcome::NotRetrying {
                    status: entry.status,
                });
            }
            entry.status = DeadLetterStatus::Retried;

            match self
                .store
                .write_if(
                    collections::DEAD_LETTERS,
                    correlation_key,
                    doc.version,
                    serde_json::to_value(&entry)?,
                )
                .await?
            {
                WriteOutcome::Written(_) => {
                    tracing::info!(correlation_key, "dead letter retried");
                    return Ok(MarkRetriedOutcome::Marked);
                }
                WriteOutcome::Conflict { .. } => continue,
            }
        }
    }

    /// Closes a non-terminal entry as `ignored` with optional notes.
    pub async fn ignore(
        &self,
        correlation_key: &str,
        notes: Option<&str>,
    ) -> Result<IgnoreOutcome> {
        loop {
            let Some(doc) = self
                .store
                .read(collections::DEAD_LETTERS, correlation_key)
                .await?
            else {
                return Ok(IgnoreOutcome::NotFound);
            };

            let mut entry: DeadLetterEntry = doc.decode()?;
            if entry.status.is_terminal() {
                return Ok(IgnoreOutcome::AlreadyTerminal {
                    status: entry.status,
                });
            }
            entry.status = DeadLetterStatus::Ignored;
            entry.notes = notes.map(str::to_string);

            match self
                .store
                .write_if(
                    collections::DEAD_LETTERS,
                    correlation_key,
                    doc.version,
                    serde_json::to_value(&entry)?,
                )
                .await?
            {
                WriteOutcome::Written(_) => return Ok(IgnoreOutcome::Ignored),
                WriteOutcome::Conflict { .. } => continue,
            }
        }
    }

    /// Lists `pending` entries, optionally restricted to correlation keys
    /// with the given prefix.
    pub async fn list_pending(&self, prefix: Option<&str>) -> Result<Vec<DeadLetterEntry>> {
        let docs = self.store.scan(collections::DEAD_LETTERS).await?;
        let mut entries = Vec::new();
        for doc in docs {
            let entry: DeadLetterEntry = doc.decode()?;
            if entry.status != DeadLetterStatus::Pending {
                continue;
            }
            if let Some(prefix) = prefix {
                if !entry.correlation_key.starts_with(prefix) {
                    continue;
                }
            }
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
        Ok(entries)
    }

    /// Returns counts by status and by correlation-key prefix.
    pub async fn stats(&self) -> Result<DeadLetterStats> {
        let docs = self.store.scan(collections::DEAD_LETTERS).await?;
        let mut stats = DeadLetterStats::default();
        for doc in docs {
            let entry: DeadLetterEntry = doc.decode()?;
            stats.total += 1;
            match entry.status {
                DeadLetterStatus::Pending => stats.pending += 1,
                DeadLetterStatus::Retrying => stats.retrying += 1,
                DeadLetterStatus::Retried => stats.retried += 1,
                DeadLetterStatus::Ignored => stats.ignored += 1,
            }
            let prefix = entry
                .correlation_key
                .split(':')
                .next()
                .unwrap_or("")
                .to_string();
            *stats.by_prefix.entry(prefix).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

/// Completion handler that routes job outcomes into the ledger.
///
/// Registered under [`DEAD_LETTER_HANDLER`] and referenced by the
/// `on_complete` target of every downstream job the orchestrator and
/// retry drivers enqueue. The context carries the correlation key and,
/// for re-enqueued retries, `{"retry": true}`.
pub struct DeadLetterRecorder {
    ledger: DeadLetterLedger,
}

impl DeadLetterRecorder {
    /// Creates a recorder over the given ledger.
    pub fn new(ledger: DeadLetterLedger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl CompletionHandler for DeadLetterRecorder {
    async fn on_complete(&self, signal: CompletionSignal, context: serde_json::Value) {
        let Some(correlation_key) = context["correlation_key"].as_str() else {
            tracing::error!(?context, "completion context missing correlation_key");
            return;
        };
        let is_retry = context["retry"].as_bool().unwrap_or(false);

        let result = match signal {
            CompletionSignal::Success { .. } => {
                if is_retry {
                    self.ledger
                        .mark_retried(correlation_key)
                        .await
                        .map(|_| ())
                } else {
                    Ok(())
                }
            }
            CompletionSignal::Failed { error, .. } => self
                .ledger
                .record_failure(correlation_key, &error)
                .await
                .map(|_| ()),
            CompletionSignal::Canceled => self
                .ledger
                .record_failure(correlation_key, "work canceled")
                .await
                .map(|_| ()),
        };

        if let Err(e) = result {
            tracing::error!(correlation_key, error = %e, "dead-letter update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::InMemoryStore;

    fn ledger() -> DeadLetterLedger {
        DeadLetterLedger::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn first_failure_creates_pending_entry() {
        let ledger = ledger();
        let outcome = ledger.record_failure("projection:order:1", "boom").await.unwrap();
        assert_eq!(outcome, RecordFailureOutcome::Recorded { attempt_count: 1 });

        let pending = ledger.list_pending(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, DeadLetterStatus::Pending);
        assert_eq!(pending[0].error, "boom");
    }

    #[tokio::test]
    async fn repeated_failures_increment_attempt_count() {
        let ledger = ledger();
        ledger.record_failure("k", "e1").await.unwrap();
        let outcome = ledger.record_failure("k", "e2").await.unwrap();
        assert_eq!(outcome, RecordFailureOutcome::Recorded { attempt_count: 2 });

        let pending = ledger.list_pending(None).await.unwrap();
        assert_eq!(pending[0].error, "e2");
    }

    #[tokio::test]
    async fn failed_retry_resets_to_pending_with_incremented_count() {
        let ledger = ledger();
        ledger.record_failure("k", "e1").await.unwrap();
        ledger.record_failure("k", "e2").await.unwrap();

        let prepared = ledger.prepare_retry("k").await.unwrap();
        assert!(matches!(prepared, PrepareRetryOutcome::Ready(_)));

        let outcome = ledger.record_failure("k", "e3").await.unwrap();
        assert_eq!(outcome, RecordFailureOutcome::Recorded { attempt_count: 3 });
        assert_eq!(ledger.list_pending(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prepare_retry_twice_is_already_processed() {
        let ledger = ledger();
        ledger.record_failure("k", "e").await.unwrap();
        ledger.prepare_retry("k").await.unwrap();

        match ledger.prepare_retry("k").await.unwrap() {
            PrepareRetryOutcome::AlreadyProcessed { status } => {
                assert_eq!(status, DeadLetterStatus::Retrying);
            }
            other => panic!("expected AlreadyProcessed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prepare_retry_on_missing_key_is_not_found() {
        let ledger = ledger();
        assert!(matches!(
            ledger.prepare_retry("nope").await.unwrap(),
            PrepareRetryOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn mark_retried_closes_entry_and_blocks_late_failures() {
        let ledger = ledger();
        ledger.record_failure("k", "e").await.unwrap();
        ledger.prepare_retry("k").await.unwrap();

        assert_eq!(
            ledger.mark_retried("k").await.unwrap(),
            MarkRetriedOutcome::Marked
        );
        assert_eq!(
            ledger.record_failure("k", "late").await.unwrap(),
            RecordFailureOutcome::Closed {
                status: DeadLetterStatus::Retried
            }
        );
    }

    #[tokio::test]
    async fn mark_retried_requires_retrying_state() {
        let ledger = ledger();
        ledger.record_failure("k", "e").await.unwrap();

        assert_eq!(
            ledger.mark_retried("k").await.unwrap(),
            MarkRetriedOutcome::NotRetrying {
                status: DeadLetterStatus::Pending
            }
        );
    }

    #[tokio::test]
    async fn ignore_is_terminal_and_drops_further_failures() {
        let ledger = ledger();
        ledger.record_failure("k", "e").await.unwrap();

        assert_eq!(
            ledger.ignore("k", Some("known flaky upstream")).await.unwrap(),
            IgnoreOutcome::Ignored
        );
        assert_eq!(
            ledger.record_failure("k", "late").await.unwrap(),
            RecordFailureOutcome::Closed {
                status: DeadLetterStatus::Ignored
            }
        );
        assert_eq!(
            ledger.ignore("k", None).await.unwrap(),
            IgnoreOutcome::AlreadyTerminal {
                status: DeadLetterStatus::Ignored
            }
        );
    }

    #[tokio::test]
    async fn list_pending_filters_by_prefix() {
        let ledger = ledger();
        ledger.record_failure("projection:order:1", "e").await.unwrap();
        ledger.record_failure("integration:order:1", "e").await.unwrap();

        let projections = ledger.list_pending(Some("projection:")).await.unwrap();
        assert_eq!(projections.len(), 1);
        assert_eq!(projections[0].correlation_key, "projection:order:1");
    }

    #[tokio::test]
    async fn stats_counts_by_status_and_prefix() {
        let ledger = ledger();
        ledger.record_failure("projection:a", "e").await.unwrap();
        ledger.record_failure("projection:b", "e").await.unwrap();
        ledger.record_failure("integration:c", "e").await.unwrap();
        ledger.ignore("integration:c", None).await.unwrap();

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.by_prefix["projection"], 2);
        assert_eq!(stats.by_prefix["integration"], 1);
    }

    #[tokio::test]
    async fn recorder_routes_failed_signal_into_ledger() {
        let ledger = ledger();
        let recorder = DeadLetterRecorder::new(ledger.clone());

        recorder
            .on_complete(
                CompletionSignal::Failed {
                    error: "handler blew up".to_string(),
                    attempts: 3,
                },
                serde_json::json!({"correlation_key": "projection:order:1"}),
            )
            .await;

        let pending = ledger.list_pending(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].error, "handler blew up");
    }

    #[tokio::test]
    async fn recorder_marks_retried_on_successful_retry() {
        let ledger = ledger();
        ledger.record_failure("k", "e").await.unwrap();
        ledger.prepare_retry("k").await.unwrap();

        let recorder = DeadLetterRecorder::new(ledger.clone());
        recorder
            .on_complete(
                CompletionSignal::Success {
                    return_value: serde_json::json!(null),
                },
                serde_json::json!({"correlation_key": "k", "retry": true}),
            )
            .await;

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.retried, 1);
    }

    #[tokio::test]
    async fn recorder_success_without_retry_flag_is_a_no_op() {
        let ledger = ledger();
        let recorder = DeadLetterRecorder::new(ledger.clone());
        recorder
            .on_complete(
                CompletionSignal::Success {
                    return_value: serde_json::json!(null),
                },
                serde_json::json!({"correlation_key": "k"}),
            )
            .await;

        assert_eq!(ledger.stats().await.unwrap().total, 0);
    }
}
