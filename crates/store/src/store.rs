use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

use crate::{EventRecord, Result};

/// Version number for a stored document, used for optimistic concurrency
/// control.
///
/// Versions start at 1 for the first write and increment by 1 per
/// successful conditional write; 0 means the document does not exist yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for an absent document.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) for the first write.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A versioned document read from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedDoc {
    /// The document key within its collection.
    pub key: String,

    /// Current version, incremented once per successful conditional write.
    pub version: Version,

    /// The document value as JSON.
    pub value: serde_json::Value,

    /// When the document was last written.
    pub updated_at: DateTime<Utc>,
}

impl VersionedDoc {
    /// Deserializes the document value into a typed struct.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// Outcome of a version-guarded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write succeeded; the document is now at this version.
    Written(Version),

    /// The stored version did not match the expected version. No mutation
    /// was performed.
    Conflict {
        /// The version actually stored (0 if the document is absent).
        actual: Version,
    },
}

/// Outcome of a unique insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// The document was inserted at version 1.
    Inserted,

    /// A document with this key already exists; the existing document is
    /// returned unchanged.
    Exists(VersionedDoc),
}

/// Outcome of an event append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was appended.
    Appended(EventId),

    /// An event with this idempotency key already exists; its ID is
    /// returned and nothing was written.
    Duplicate(EventId),
}

impl AppendOutcome {
    /// Returns the event ID regardless of which variant occurred.
    pub fn event_id(&self) -> EventId {
        match self {
            AppendOutcome::Appended(id) | AppendOutcome::Duplicate(id) => *id,
        }
    }
}

/// Outcome of an atomic dual write (state update + event append).
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// Both the state update and the event append are durable.
    Committed {
        /// The scope's new version.
        version: Version,
        /// Whether the event was appended now or had already been recorded.
        append: AppendOutcome,
    },

    /// The scope version moved concurrently. Neither the state nor the
    /// event was written.
    Conflict {
        /// The scope version actually stored.
        actual: Version,
    },
}

/// Core trait for transactional store implementations.
///
/// All implementations must be thread-safe (Send + Sync). Conditional
/// writes report conflicts as outcomes, never as errors; only
/// infrastructure faults surface through [`crate::StoreError`].
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Reads a document by collection and key.
    async fn read(&self, collection: &str, key: &str) -> Result<Option<VersionedDoc>>;

    /// Conditionally writes a document.
    ///
    /// Succeeds only if the stored version equals `expected` (use
    /// `Version::initial()` for "must not exist"). On success the document
    /// is stored at `expected.next()`.
    async fn write_if(
        &self,
        collection: &str,
        key: &str,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<WriteOutcome>;

    /// Inserts a document guarded by key uniqueness. A racing duplicate is
    /// reported as `Exists`, never as an error.
    async fn insert(
        &self,
        collection: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<InsertOutcome>;

    /// Deletes a document. Returns true if a document was removed.
    async fn delete(&self, collection: &str, key: &str) -> Result<bool>;

    /// Finds documents whose value has `field` equal to `value` (string
    /// comparison on the top-level field).
    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<VersionedDoc>>;

    /// Returns all documents in a collection.
    async fn scan(&self, collection: &str) -> Result<Vec<VersionedDoc>>;

    /// Appends an event to the log, guarded by the record's idempotency
    /// key. This is the uniqueness backstop for concurrent appenders.
    async fn append_event(&self, record: EventRecord) -> Result<AppendOutcome>;

    /// Looks up an event by idempotency key.
    async fn event_by_idempotency_key(&self, key: &str) -> Result<Option<EventRecord>>;

    /// Returns all events for a stream, oldest first.
    async fn events_for_stream(
        &self,
        stream_type: &str,
        stream_id: &str,
    ) -> Result<Vec<EventRecord>>;

    /// Atomic dual write: conditionally updates the scope document at
    /// `scope_key` (collection [`crate::collections::SCOPES`]) and appends
    /// `record` as one transactional unit. Both happen or neither does.
    ///
    /// The version check guards the *decision*; the record's idempotency
    /// key guards the *recording*. A replayed commit (the record's
    /// idempotency key already has an event) reports `Committed` with a
    /// `Duplicate` append, carries the scope's current version, and must
    /// not reapply the state update.
    async fn commit(
        &self,
        scope_key: &str,
        expected: Version,
        state: serde_json::Value,
        record: EventRecord,
    ) -> Result<CommitOutcome>;
}
