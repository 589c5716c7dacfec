//! Idempotent event append.

use common::EventId;
use serde::{Deserialize, Serialize};

use crate::{AppendOutcome, EventRecord, Result, TransactionalStore};

/// How an idempotent append concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendStatus {
    /// The event was written now.
    Appended,

    /// An event with the same idempotency key already existed. This is a
    /// benign, expected path, never an error.
    Duplicate,
}

/// Receipt returned by [`append_idempotent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    /// Whether the event was appended now or already recorded.
    pub status: AppendStatus,

    /// The ID of the recorded event (existing one on duplicates).
    pub event_id: EventId,
}

/// Appends an event at most once per idempotency key.
///
/// The lookup-then-insert here is not atomic; the store's uniqueness
/// constraint on the idempotency key is the actual correctness backstop.
/// A racing duplicate insert is converted into a `Duplicate` receipt
/// rather than propagated as an error.
pub async fn append_idempotent(
    store: &dyn TransactionalStore,
    record: EventRecord,
) -> Result<AppendReceipt> {
    if let Some(existing) = store
        .event_by_idempotency_key(&record.idempotency_key)
        .await?
    {
        return Ok(AppendReceipt {
            status: AppendStatus::Duplicate,
            event_id: existing.event_id,
        });
    }

    match store.append_event(record).await? {
        AppendOutcome::Appended(event_id) => Ok(AppendReceipt {
            status: AppendStatus::Appended,
            event_id,
        }),
        AppendOutcome::Duplicate(event_id) => Ok(AppendReceipt {
            status: AppendStatus::Duplicate,
            event_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStore;

    fn make_record(key: &str) -> EventRecord {
        EventRecord::builder()
            .idempotency_key(key)
            .stream_type("order")
            .stream_id("ORD-1")
            .event_type("OrderPlaced")
            .payload_raw(serde_json::json!({"total": 100}))
            .build()
    }

    #[tokio::test]
    async fn first_append_is_appended() {
        let store = InMemoryStore::new();
        let receipt = append_idempotent(&store, make_record("k1")).await.unwrap();
        assert_eq!(receipt.status, AppendStatus::Appended);
    }

    #[tokio::test]
    async fn second_append_is_duplicate_with_original_id() {
        let store = InMemoryStore::new();
        let first = append_idempotent(&store, make_record("k1")).await.unwrap();
        let second = append_idempotent(&store, make_record("k1")).await.unwrap();

        assert_eq!(second.status, AppendStatus::Duplicate);
        assert_eq!(second.event_id, first.event_id);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn distinct_keys_both_append() {
        let store = InMemoryStore::new();
        append_idempotent(&store, make_record("k1")).await.unwrap();
        append_idempotent(&store, make_record("k2")).await.unwrap();
        assert_eq!(store.event_count().await, 2);
    }
}
