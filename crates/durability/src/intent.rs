//! Command intent ledger.
//!
//! An intent brackets an external call that has no synchronous durability
//! guarantee (e.g. a payment request): it is opened immediately before
//! dispatch and closed by the completion signal. A periodic orphan scan
//! marks `pending` intents older than their timeout as `abandoned`, so no
//! dispatched call is ever silently lost.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};
use store::{collections, InsertOutcome, TransactionalStore, WriteOutcome};

use crate::error::Result;

/// Lifecycle state of a command intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Dispatched, awaiting a completion signal.
    Pending,

    /// The external call completed and its event was recorded.
    Completed,

    /// The external call reported failure.
    Failed,

    /// No completion signal arrived within the timeout. Requires human
    /// investigation; never auto-resolved.
    Abandoned,
}

impl IntentStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IntentStatus::Pending)
    }
}

/// A bracket around one external call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandIntent {
    /// Unique key for this intent (typically `{operation}:{stream_id}:{command_id}`).
    pub intent_key: String,

    /// The external operation type (e.g. `payment`).
    pub operation_type: String,

    /// The aggregate type the call acts on.
    pub stream_type: String,

    /// The aggregate instance ID.
    pub stream_id: String,

    /// Current lifecycle state.
    pub status: IntentStatus,

    /// How long after `created_at` a `pending` intent counts as orphaned.
    pub timeout_ms: u64,

    /// When the intent was opened.
    pub created_at: DateTime<Utc>,

    /// The event recorded on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,

    /// The error reported on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of [`CommandIntentLedger::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A fresh `pending` intent was created.
    Opened,

    /// An intent with this key already exists (redelivered dispatch).
    AlreadyOpen,
}

/// Outcome of [`CommandIntentLedger::complete`] and [`CommandIntentLedger::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The intent moved from `pending` to the terminal state.
    Closed,

    /// The intent was already terminal; nothing changed.
    AlreadyClosed {
        /// The status the intent holds.
        status: IntentStatus,
    },

    /// No intent exists for this key.
    NotFound,
}

/// The command intent ledger.
#[derive(Clone)]
pub struct CommandIntentLedger {
    store: Arc<dyn TransactionalStore>,
}

impl CommandIntentLedger {
    /// Creates a ledger over the given store.
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self { store }
    }

    /// Opens a `pending` intent. Idempotent per intent key.
    pub async fn open(
        &self,
        intent_key: &str,
        operation_type: &str,
        stream_type: &str,
        stream_id: &str,
        timeout_ms: u64,
    ) -> Result<OpenOutcome> {
        let intent = CommandIntent {
            intent_key: intent_key.to_string(),
            operation_type: operation_type.to_string(),
            stream_type: stream_type.to_string(),
            stream_id: stream_id.to_string(),
            status: IntentStatus::Pending,
            timeout_ms,
            created_at: Utc::now(),
            event_id: None,
            error: None,
        };

        match self
            .store
            .insert(
                collections::INTENTS,
                intent_key,
                serde_json::to_value(&intent)?,
            )
            .await?
        {
            InsertOutcome::Inserted => Ok(OpenOutcome::Opened),
            InsertOutcome::Exists(_) => Ok(OpenOutcome::AlreadyOpen),
        }
    }

    /// Closes a `pending` intent as `completed`, recording the event that
    /// captured the call's result.
    pub async fn complete(&self, intent_key: &str, event_id: EventId) -> Result<CloseOutcome> {
        self.close(intent_key, IntentStatus::Completed, Some(event_id), None)
            .await
    }

    /// Closes a `pending` intent as `failed` with the reported error.
    pub async fn fail(&self, intent_key: &str, error: &str) -> Result<CloseOutcome> {
        self.close(intent_key, IntentStatus::Failed, None, Some(error))
            .await
    }

    async fn close(
        &self,
        intent_key: &str,
        status: IntentStatus,
        event_id: Option<EventId>,
        error: Option<&str>,
    ) -> Result<CloseOutcome> {
        loop {
            let Some(doc) = self.store.read(collections::INTENTS, intent_key).await? else {
                return Ok(CloseOutcome::NotFound);
            };

            let mut intent: CommandIntent = doc.decode()?;
            if intent.status != IntentStatus::Pending {
                return Ok(CloseOutcome::AlreadyClosed {
                    status: intent.status,
                });
            }
            intent.status = status;
            intent.event_id = event_id;
            intent.error = error.map(str::to_string);

            match self
                .store
                .write_if(
                    collections::INTENTS,
                    intent_key,
                    doc.version,
                    serde_json::to_value(&intent)?,
                )
                .await?
            {
                WriteOutcome::Written(_) => return Ok(CloseOutcome::Closed),
                WriteOutcome::Conflict { .. } => continue,
            }
        }
    }

    /// Scans for `pending` intents that have outlived their timeout and
    /// marks them `abandoned`. Returns the number of intents abandoned by
    /// this call.
    ///
    /// The `pending -> abandoned` transition is version-guarded, so a
    /// racing `complete`/`fail` that lands first wins and the intent is
    /// skipped. Repeated scans do not double-count.
    #[tracing::instrument(skip(self))]
    pub async fn detect_orphans(&self) -> Result<u64> {
        self.detect_orphans_at(Utc::now()).await
    }

    /// Orphan detection with an explicit clock, for tests.
    pub async fn detect_orphans_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let docs = self.store.scan(collections::INTENTS).await?;
        let mut abandoned = 0u64;

        for doc in docs {
            let mut intent: CommandIntent = doc.decode()?;
            if intent.status != IntentStatus::Pending {
                continue;
            }
            // Timeouts past i64::MAX milliseconds saturate instead of
            // wrapping negative, which would abandon the intent at once.
            // A deadline past the datetime range never expires.
            let timeout = i64::try_from(intent.timeout_ms).unwrap_or(i64::MAX);
            let expired = intent
                .created_at
                .checked_add_signed(Duration::milliseconds(timeout))
                .is_some_and(|deadline| now > deadline);
            if !expired {
                continue;
            }

            intent.status = IntentStatus::Abandoned;
            match self
                .store
                .write_if(
                    collections::INTENTS,
                    &intent.intent_key,
                    doc.version,
                    serde_json::to_value(&intent)?,
                )
                .await?
            {
                WriteOutcome::Written(_) => {
                    tracing::warn!(
                        intent_key = %intent.intent_key,
                        operation_type = %intent.operation_type,
                        "intent abandoned: no completion signal within timeout"
                    );
                    metrics::counter!("intents_abandoned_total").increment(1);
                    abandoned += 1;
                }
                // A racing complete/fail landed first; it wins.
                WriteOutcome::Conflict { .. } => continue,
            }
        }

        Ok(abandoned)
    }

    /// Looks up an intent by key.
    pub async fn get(&self, intent_key: &str) -> Result<Option<CommandIntent>> {
        match self.store.read(collections::INTENTS, intent_key).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::InMemoryStore;

    fn ledger() -> CommandIntentLedger {
        CommandIntentLedger::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn open_then_complete() {
        let ledger = ledger();
        let opened = ledger
            .open("payment:ORD-1:cmd-1", "payment", "order", "ORD-1", 30_000)
            .await
            .unwrap();
        assert_eq!(opened, OpenOutcome::Opened);

        let event_id = EventId::new();
        assert_eq!(
            ledger.complete("payment:ORD-1:cmd-1", event_id).await.unwrap(),
            CloseOutcome::Closed
        );

        let intent = ledger.get("payment:ORD-1:cmd-1").await.unwrap().unwrap();
        assert_eq!(intent.status, IntentStatus::Completed);
        assert_eq!(intent.event_id, Some(event_id));
    }

    #[tokio::test]
    async fn reopen_is_already_open() {
        let ledger = ledger();
        ledger.open("k", "payment", "order", "O1", 1000).await.unwrap();
        assert_eq!(
            ledger.open("k", "payment", "order", "O1", 1000).await.unwrap(),
            OpenOutcome::AlreadyOpen
        );
    }

    #[tokio::test]
    async fn fail_records_error() {
        let ledger = ledger();
        ledger.open("k", "payment", "order", "O1", 1000).await.unwrap();
        ledger.fail("k", "card declined").await.unwrap();

        let intent = ledger.get("k").await.unwrap().unwrap();
        assert_eq!(intent.status, IntentStatus::Failed);
        assert_eq!(intent.error.as_deref(), Some("card declined"));
    }

    #[tokio::test]
    async fn closing_twice_reports_already_closed() {
        let ledger = ledger();
        ledger.open("k", "payment", "order", "O1", 1000).await.unwrap();
        ledger.complete("k", EventId::new()).await.unwrap();

        assert_eq!(
            ledger.fail("k", "late failure").await.unwrap(),
            CloseOutcome::AlreadyClosed {
                status: IntentStatus::Completed
            }
        );
    }

    #[tokio::test]
    async fn close_on_missing_key_is_not_found() {
        let ledger = ledger();
        assert_eq!(
            ledger.complete("nope", EventId::new()).await.unwrap(),
            CloseOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn orphan_scan_abandons_only_expired_pending_intents() {
        let ledger = ledger();
        ledger.open("old", "payment", "order", "O1", 1000).await.unwrap();
        ledger.open("fresh", "payment", "order", "O2", 1000).await.unwrap();
        ledger.open("done", "payment", "order", "O3", 1000).await.unwrap();
        ledger.complete("done", EventId::new()).await.unwrap();

        let later = Utc::now() + Duration::milliseconds(1500);
        // "fresh" has the same age as "old" here; push only "old" past its
        // timeout by giving "fresh" a longer one.
        let ledger2 = ledger.clone();
        ledger2.open("slow", "payment", "order", "O4", 60_000).await.unwrap();

        let abandoned = ledger.detect_orphans_at(later).await.unwrap();
        // "old" and "fresh" both expired (1000ms timeout), "done" is
        // terminal, "slow" still within its window.
        assert_eq!(abandoned, 2);

        assert_eq!(
            ledger.get("old").await.unwrap().unwrap().status,
            IntentStatus::Abandoned
        );
        assert_eq!(
            ledger.get("done").await.unwrap().unwrap().status,
            IntentStatus::Completed
        );
        assert_eq!(
            ledger.get("slow").await.unwrap().unwrap().status,
            IntentStatus::Pending
        );
    }

    #[tokio::test]
    async fn orphan_scan_keeps_intents_with_oversized_timeouts_pending() {
        let ledger = ledger();
        ledger.open("k", "payment", "order", "O1", u64::MAX).await.unwrap();

        let later = Utc::now() + Duration::days(365);
        assert_eq!(ledger.detect_orphans_at(later).await.unwrap(), 0);
        assert_eq!(
            ledger.get("k").await.unwrap().unwrap().status,
            IntentStatus::Pending
        );
    }

    #[tokio::test]
    async fn orphan_scan_is_idempotent() {
        let ledger = ledger();
        ledger.open("k", "payment", "order", "O1", 100).await.unwrap();

        let later = Utc::now() + Duration::milliseconds(500);
        assert_eq!(ledger.detect_orphans_at(later).await.unwrap(), 1);
        assert_eq!(ledger.detect_orphans_at(later).await.unwrap(), 0);
    }
}
