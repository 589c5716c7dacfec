use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    AppendOutcome, CommitOutcome, EventRecord, InsertOutcome, Result, Version, VersionedDoc,
    WriteOutcome, collections, store::TransactionalStore,
};

#[derive(Default)]
struct Inner {
    docs: HashMap<(String, String), VersionedDoc>,
    events: Vec<EventRecord>,
    events_by_key: HashMap<String, usize>,
}

/// In-memory store implementation for testing.
///
/// Provides the same interface and outcome semantics as the PostgreSQL
/// implementation: all mutations go through a single lock, which is what
/// makes the dual-write `commit` atomic here.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Returns the number of documents in a collection.
    pub async fn doc_count(&self, collection: &str) -> usize {
        self.inner
            .read()
            .await
            .docs
            .keys()
            .filter(|(c, _)| c == collection)
            .count()
    }

    /// Clears all documents and events.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.docs.clear();
        inner.events.clear();
        inner.events_by_key.clear();
    }
}

fn write_doc(
    inner: &mut Inner,
    collection: &str,
    key: &str,
    expected: Version,
    value: serde_json::Value,
) -> WriteOutcome {
    let map_key = (collection.to_string(), key.to_string());
    let current = inner
        .docs
        .get(&map_key)
        .map(|d| d.version)
        .unwrap_or_else(Version::initial);

    if current != expected {
        return WriteOutcome::Conflict { actual: current };
    }

    let next = expected.next();
    inner.docs.insert(
        map_key,
        VersionedDoc {
            key: key.to_string(),
            version: next,
            value,
            updated_at: Utc::now(),
        },
    );
    WriteOutcome::Written(next)
}

fn append_record(inner: &mut Inner, record: EventRecord) -> AppendOutcome {
    if let Some(&idx) = inner.events_by_key.get(&record.idempotency_key) {
        return AppendOutcome::Duplicate(inner.events[idx].event_id);
    }
    let event_id = record.event_id;
    inner
        .events_by_key
        .insert(record.idempotency_key.clone(), inner.events.len());
    inner.events.push(record);
    AppendOutcome::Appended(event_id)
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn read(&self, collection: &str, key: &str) -> Result<Option<VersionedDoc>> {
        let inner = self.inner.read().await;
        Ok(inner
            .docs
            .get(&(collection.to_string(), key.to_string()))
            .cloned())
    }

    async fn write_if(
        &self,
        collection: &str,
        key: &str,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<WriteOutcome> {
        let mut inner = self.inner.write().await;
        Ok(write_doc(&mut inner, collection, key, expected, value))
    }

    async fn insert(
        &self,
        collection: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<InsertOutcome> {
        let mut inner = self.inner.write().await;
        let map_key = (collection.to_string(), key.to_string());
        if let Some(existing) = inner.docs.get(&map_key) {
            return Ok(InsertOutcome::Exists(existing.clone()));
        }
        inner.docs.insert(
            map_key,
            VersionedDoc {
                key: key.to_string(),
                version: Version::first(),
                value,
                updated_at: Utc::now(),
            },
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .docs
            .remove(&(collection.to_string(), key.to_string()))
            .is_some())
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<VersionedDoc>> {
        let inner = self.inner.read().await;
        let mut docs: Vec<_> = inner
            .docs
            .iter()
            .filter(|((c, _), doc)| {
                c == collection
                    && doc
                        .value
                        .get(field)
                        .and_then(|v| v.as_str())
                        .is_some_and(|v| v == value)
            })
            .map(|(_, doc)| doc.clone())
            .collect();
        docs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(docs)
    }

    async fn scan(&self, collection: &str) -> Result<Vec<VersionedDoc>> {
        let inner = self.inner.read().await;
        let mut docs: Vec<_> = inner
            .docs
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|(_, doc)| doc.clone())
            .collect();
        docs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(docs)
    }

    async fn append_event(&self, record: EventRecord) -> Result<AppendOutcome> {
        let mut inner = self.inner.write().await;
        Ok(append_record(&mut inner, record))
    }

    async fn event_by_idempotency_key(&self, key: &str) -> Result<Option<EventRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events_by_key
            .get(key)
            .map(|&idx| inner.events[idx].clone()))
    }

    async fn events_for_stream(
        &self,
        stream_type: &str,
        stream_id: &str,
    ) -> Result<Vec<EventRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.stream_type == stream_type && e.stream_id == stream_id)
            .cloned()
            .collect())
    }

    async fn commit(
        &self,
        scope_key: &str,
        expected: Version,
        state: serde_json::Value,
        record: EventRecord,
    ) -> Result<CommitOutcome> {
        let mut inner = self.inner.write().await;

        // A recorded event with this idempotency key means an earlier
        // commit already applied this decision; re-running the state
        // write would apply it twice. Report the replay instead.
        if let Some(&idx) = inner.events_by_key.get(&record.idempotency_key) {
            let event_id = inner.events[idx].event_id;
            let version = inner
                .docs
                .get(&(collections::SCOPES.to_string(), scope_key.to_string()))
                .map(|d| d.version)
                .unwrap_or_else(Version::initial);
            return Ok(CommitOutcome::Committed {
                version,
                append: AppendOutcome::Duplicate(event_id),
            });
        }

        match write_doc(&mut inner, collections::SCOPES, scope_key, expected, state) {
            WriteOutcome::Conflict { actual } => Ok(CommitOutcome::Conflict { actual }),
            WriteOutcome::Written(version) => {
                let append = append_record(&mut inner, record);
                Ok(CommitOutcome::Committed { version, append })
            }
        }
    }
}
