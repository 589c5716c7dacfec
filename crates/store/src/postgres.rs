use async_trait::async_trait;
use chrono::Utc;
use common::EventId;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AppendOutcome, CommitOutcome, EventRecord, InsertOutcome, Result, Version, VersionedDoc,
    WriteOutcome, collections, store::TransactionalStore,
};

/// PostgreSQL-backed transactional store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_doc(row: PgRow) -> Result<VersionedDoc> {
        Ok(VersionedDoc {
            key: row.try_get("key")?,
            version: Version::new(row.try_get("version")?),
            value: row.try_get("value")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_event(row: PgRow) -> Result<EventRecord> {
        Ok(EventRecord {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            idempotency_key: row.try_get("idempotency_key")?,
            stream_type: row.try_get("stream_type")?,
            stream_id: row.try_get("stream_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            bounded_context: row.try_get("bounded_context")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

/// Inserts an event inside an executor, returning the recorded event ID.
///
/// Relies on the unique constraint on `idempotency_key`: a losing racer
/// gets zero rows back and reads the winner's ID instead.
async fn append_event_tx<'e, E>(executor: E, record: &EventRecord) -> Result<Option<EventId>>
where
    E: sqlx::PgExecutor<'e>,
{
    let inserted: Option<Uuid> = sqlx::query_scalar(
        r#"
        INSERT INTO events (id, idempotency_key, stream_type, stream_id, event_type, payload, bounded_context, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(record.event_id.as_uuid())
    .bind(&record.idempotency_key)
    .bind(&record.stream_type)
    .bind(&record.stream_id)
    .bind(&record.event_type)
    .bind(&record.payload)
    .bind(&record.bounded_context)
    .bind(record.recorded_at)
    .fetch_optional(executor)
    .await?;

    Ok(inserted.map(EventId::from_uuid))
}

#[async_trait]
impl TransactionalStore for PostgresStore {
    async fn read(&self, collection: &str, key: &str) -> Result<Option<VersionedDoc>> {
        let row = sqlx::query(
            r#"
            SELECT key, version, value, updated_at
            FROM documents
            WHERE collection = $1 AND key = $2
            "#,
        )
        .bind(collection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_doc).transpose()
    }

    async fn write_if(
        &self,
        collection: &str,
        key: &str,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<WriteOutcome> {
        let next = expected.next();

        let rows = if expected == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO documents (collection, key, version, value, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (collection, key) DO NOTHING
                "#,
            )
            .bind(collection)
            .bind(key)
            .bind(next.as_i64())
            .bind(&value)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE documents
                SET version = $4, value = $5, updated_at = $6
                WHERE collection = $1 AND key = $2 AND version = $3
                "#,
            )
            .bind(collection)
            .bind(key)
            .bind(expected.as_i64())
            .bind(next.as_i64())
            .bind(&value)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if rows == 1 {
            return Ok(WriteOutcome::Written(next));
        }

        let actual: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM documents WHERE collection = $1 AND key = $2",
        )
        .bind(collection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(WriteOutcome::Conflict {
            actual: Version::new(actual.unwrap_or(0)),
        })
    }

    async fn insert(
        &self,
        collection: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<InsertOutcome> {
        let rows = sqlx::query(
            r#"
            INSERT INTO documents (collection, key, version, value, updated_at)
            VALUES ($1, $2, 1, $3, $4)
            ON CONFLICT (collection, key) DO NOTHING
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(&value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 1 {
            return Ok(InsertOutcome::Inserted);
        }

        // Lost the race (or the key already existed): return the winner.
        let existing = self.read(collection, key).await?;
        match existing {
            Some(doc) => Ok(InsertOutcome::Exists(doc)),
            // The row vanished between insert and read; retry the insert.
            None => self.insert(collection, key, value).await,
        }
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM documents WHERE collection = $1 AND key = $2")
            .bind(collection)
            .bind(key)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows == 1)
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<VersionedDoc>> {
        let rows = sqlx::query(
            r#"
            SELECT key, version, value, updated_at
            FROM documents
            WHERE collection = $1 AND value->>$2 = $3
            ORDER BY updated_at ASC
            "#,
        )
        .bind(collection)
        .bind(field)
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_doc).collect()
    }

    async fn scan(&self, collection: &str) -> Result<Vec<VersionedDoc>> {
        let rows = sqlx::query(
            r#"
            SELECT key, version, value, updated_at
            FROM documents
            WHERE collection = $1
            ORDER BY updated_at ASC
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_doc).collect()
    }

    async fn append_event(&self, record: EventRecord) -> Result<AppendOutcome> {
        if let Some(id) = append_event_tx(&self.pool, &record).await? {
            return Ok(AppendOutcome::Appended(id));
        }

        let existing: Uuid =
            sqlx::query_scalar("SELECT id FROM events WHERE idempotency_key = $1")
                .bind(&record.idempotency_key)
                .fetch_one(&self.pool)
                .await?;

        Ok(AppendOutcome::Duplicate(EventId::from_uuid(existing)))
    }

    async fn event_by_idempotency_key(&self, key: &str) -> Result<Option<EventRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, idempotency_key, stream_type, stream_id, event_type, payload, bounded_context, recorded_at
            FROM events
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_event).transpose()
    }

    async fn events_for_stream(
        &self,
        stream_type: &str,
        stream_id: &str,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, idempotency_key, stream_type, stream_id, event_type, payload, bounded_context, recorded_at
            FROM events
            WHERE stream_type = $1 AND stream_id = $2
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(stream_type)
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn commit(
        &self,
        scope_key: &str,
        expected: Version,
        state: serde_json::Value,
        record: EventRecord,
    ) -> Result<CommitOutcome> {
        let next = expected.next();
        let mut tx = self.pool.begin().await?;

        // An event with this idempotency key means an earlier commit
        // already applied this decision; skip the state write and report
        // the replay. The lookup runs inside the transaction so a racing
        // first commit is still caught by the unique constraint below.
        let recorded: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM events WHERE idempotency_key = $1")
                .bind(&record.idempotency_key)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(id) = recorded {
            tx.rollback().await?;
            let version: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM documents WHERE collection = $1 AND key = $2",
            )
            .bind(collections::SCOPES)
            .bind(scope_key)
            .fetch_optional(&self.pool)
            .await?;

            return Ok(CommitOutcome::Committed {
                version: Version::new(version.unwrap_or(0)),
                append: AppendOutcome::Duplicate(EventId::from_uuid(id)),
            });
        }

        let rows = if expected == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO documents (collection, key, version, value, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (collection, key) DO NOTHING
                "#,
            )
            .bind(collections::SCOPES)
            .bind(scope_key)
            .bind(next.as_i64())
            .bind(&state)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE documents
                SET version = $4, value = $5, updated_at = $6
                WHERE collection = $1 AND key = $2 AND version = $3
                "#,
            )
            .bind(collections::SCOPES)
            .bind(scope_key)
            .bind(expected.as_i64())
            .bind(next.as_i64())
            .bind(&state)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        if rows != 1 {
            tx.rollback().await?;
            let actual: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM documents WHERE collection = $1 AND key = $2",
            )
            .bind(collections::SCOPES)
            .bind(scope_key)
            .fetch_optional(&self.pool)
            .await?;

            return Ok(CommitOutcome::Conflict {
                actual: Version::new(actual.unwrap_or(0)),
            });
        }

        let append = match append_event_tx(&mut *tx, &record).await? {
            Some(id) => AppendOutcome::Appended(id),
            None => {
                let existing: Uuid =
                    sqlx::query_scalar("SELECT id FROM events WHERE idempotency_key = $1")
                        .bind(&record.idempotency_key)
                        .fetch_one(&mut *tx)
                        .await?;
                AppendOutcome::Duplicate(EventId::from_uuid(existing))
            }
        };

        tx.commit().await?;
        Ok(CommitOutcome::Committed {
            version: next,
            append,
        })
    }
}
