//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use sqlx::PgPool;
use store::{
    AppendOutcome, CommitOutcome, EventRecord, InsertOutcome, PostgresStore, TransactionalStore,
    Version, WriteOutcome, collections,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            // Create a temporary pool just for migrations
            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!("../../../migrations/001_core_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    // Clear tables for test isolation
    sqlx::query("TRUNCATE TABLE documents, events")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStore::new(pool)
}

fn make_record(idempotency_key: &str, stream_id: &str) -> EventRecord {
    EventRecord::builder()
        .idempotency_key(idempotency_key)
        .stream_type("product")
        .stream_id(stream_id)
        .event_type("StockReserved")
        .payload_raw(serde_json::json!({"quantity": 2}))
        .bounded_context("inventory")
        .build()
}

#[tokio::test]
async fn write_if_and_read_roundtrip() {
    let store = get_test_store().await;

    let outcome = store
        .write_if(
            "scopes",
            "acme:product:SKU-1",
            Version::initial(),
            serde_json::json!({"available": 5}),
        )
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Written(Version::first()));

    let doc = store
        .read("scopes", "acme:product:SKU-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.version, Version::first());
    assert_eq!(doc.value, serde_json::json!({"available": 5}));
}

#[tokio::test]
async fn write_if_conflict_reports_actual_and_mutates_nothing() {
    let store = get_test_store().await;

    store
        .write_if("scopes", "k", Version::initial(), serde_json::json!({"n": 1}))
        .await
        .unwrap();

    let outcome = store
        .write_if("scopes", "k", Version::initial(), serde_json::json!({"n": 2}))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WriteOutcome::Conflict {
            actual: Version::first()
        }
    );

    let doc = store.read("scopes", "k").await.unwrap().unwrap();
    assert_eq!(doc.value, serde_json::json!({"n": 1}));
}

#[tokio::test]
async fn write_if_conflict_on_absent_doc_reports_zero() {
    let store = get_test_store().await;

    let outcome = store
        .write_if("scopes", "missing", Version::new(3), serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WriteOutcome::Conflict {
            actual: Version::initial()
        }
    );
}

#[tokio::test]
async fn insert_is_unique_per_key() {
    let store = get_test_store().await;

    let first = store
        .insert("intents", "i1", serde_json::json!({"status": "pending"}))
        .await
        .unwrap();
    assert!(matches!(first, InsertOutcome::Inserted));

    let second = store
        .insert("intents", "i1", serde_json::json!({"status": "other"}))
        .await
        .unwrap();
    match second {
        InsertOutcome::Exists(doc) => {
            assert_eq!(doc.value, serde_json::json!({"status": "pending"}));
        }
        InsertOutcome::Inserted => panic!("expected Exists"),
    }
}

#[tokio::test]
async fn append_event_converts_racing_duplicate() {
    let store = get_test_store().await;

    let first = store.append_event(make_record("k1", "SKU-1")).await.unwrap();
    let second = store.append_event(make_record("k1", "SKU-1")).await.unwrap();

    let first_id = first.event_id();
    assert!(matches!(first, AppendOutcome::Appended(_)));
    assert!(matches!(second, AppendOutcome::Duplicate(id) if id == first_id));

    let events = store.events_for_stream("product", "SKU-1").await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn event_lookup_by_idempotency_key() {
    let store = get_test_store().await;

    store.append_event(make_record("payment:ORD-1:c1", "SKU-1")).await.unwrap();

    let found = store
        .event_by_idempotency_key("payment:ORD-1:c1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.event_type, "StockReserved");
    assert_eq!(found.bounded_context, "inventory");

    let missing = store.event_by_idempotency_key("nope").await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn commit_is_atomic_on_conflict() {
    let store = get_test_store().await;

    let outcome = store
        .commit(
            "acme:product:SKU-9",
            Version::initial(),
            serde_json::json!({"available": 3}),
            make_record("cmd:a", "SKU-9"),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed { .. }));

    // Losing commit: neither the state nor the event lands.
    let outcome = store
        .commit(
            "acme:product:SKU-9",
            Version::initial(),
            serde_json::json!({"available": 99}),
            make_record("cmd:b", "SKU-9"),
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        CommitOutcome::Conflict { actual } if actual == Version::first()
    ));

    let doc = store
        .read(collections::SCOPES, "acme:product:SKU-9")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.value, serde_json::json!({"available": 3}));

    let events = store.events_for_stream("product", "SKU-9").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].idempotency_key, "cmd:a");
}

#[tokio::test]
async fn commit_replay_reports_duplicate_append() {
    let store = get_test_store().await;

    store
        .commit(
            "k",
            Version::initial(),
            serde_json::json!({"a": 1}),
            make_record("cmd:same", "S"),
        )
        .await
        .unwrap();

    // Same event key against the advanced scope: state moves, the event
    // stays recorded exactly once.
    let outcome = store
        .commit(
            "k",
            Version::first(),
            serde_json::json!({"a": 2}),
            make_record("cmd:same", "S"),
        )
        .await
        .unwrap();

    match outcome {
        CommitOutcome::Committed { version, append } => {
            assert_eq!(version, Version::new(2));
            assert!(matches!(append, AppendOutcome::Duplicate(_)));
        }
        CommitOutcome::Conflict { .. } => panic!("unexpected conflict"),
    }

    let events = store.events_for_stream("product", "S").await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn find_by_field_and_scan() {
    let store = get_test_store().await;

    store
        .insert("dead_letters", "a", serde_json::json!({"status": "pending"}))
        .await
        .unwrap();
    store
        .insert("dead_letters", "b", serde_json::json!({"status": "ignored"}))
        .await
        .unwrap();

    let pending = store
        .find_by_field("dead_letters", "status", "pending")
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key, "a");

    let all = store.scan("dead_letters").await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn delete_removes_row() {
    let store = get_test_store().await;

    store
        .insert("sagas", "OrderFulfillment:1", serde_json::json!({}))
        .await
        .unwrap();
    assert!(store.delete("sagas", "OrderFulfillment:1").await.unwrap());
    assert!(!store.delete("sagas", "OrderFulfillment:1").await.unwrap());
}
