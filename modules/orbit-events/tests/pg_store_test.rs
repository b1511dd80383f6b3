//! Integration tests for PgStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::collections::BTreeMap;

use serde_json::json;
use tokio::sync::{Mutex, MutexGuard};

use orbit_common::StoreConfig;
use orbit_events::substrate::ENTITIES_TABLE;
use orbit_events::{CommitError, DatabaseBackend, PgStore, ScanRange, Substrate, WriteBatch};
use orbit_world::{EntityId, Event, EventPayload, TaskContent, TaskContentField};

// Tests share one database and truncate it, so they take turns.
static DB: Mutex<()> = Mutex::const_new(());

/// Get a clean store, or skip if no test DB is available.
async fn test_store() -> Option<(PgStore, MutexGuard<'static, ()>)> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let turn = DB.lock().await;
    let store = PgStore::connect(&url).await.ok()?;
    store.migrate().await.ok()?;
    store.truncate().await.ok()?;
    Some((store, turn))
}

fn ingest(entity: &str, event_id: &str, ts: i64) -> Event {
    Event::new(
        EntityId::from(entity),
        ts,
        EventPayload::TaskIngest {
            content: TaskContent::Plain {
                body: TaskContentField::text("Mitochondria"),
            },
            provenance: None,
            metadata: BTreeMap::new(),
        },
    )
    .with_id(event_id)
}

// =========================================================================
// Substrate contract
// =========================================================================

#[tokio::test]
async fn put_get_and_delete() {
    let Some((store, _turn)) = test_store().await else {
        return;
    };

    let mut batch = WriteBatch::new();
    batch.put("t", "k1", json!({"v": 1}));
    batch.put("t", "k2", json!({"v": 2}));
    store.commit(batch).await.unwrap();
    assert_eq!(store.get("t", "k1").await.unwrap(), Some(json!({"v": 1})));
    assert_eq!(
        store.get_many("t", &["k2".into(), "nope".into()]).await.unwrap(),
        vec![Some(json!({"v": 2})), None]
    );

    let mut batch = WriteBatch::new();
    batch.delete("t", "k1");
    store.commit(batch).await.unwrap();
    assert_eq!(store.get("t", "k1").await.unwrap(), None);
}

#[tokio::test]
async fn get_many_answers_repeated_keys() {
    let Some((store, _turn)) = test_store().await else {
        return;
    };

    let mut batch = WriteBatch::new();
    batch.put("t", "k1", json!({"v": 1}));
    store.commit(batch).await.unwrap();
    assert_eq!(
        store
            .get_many("t", &["k1".into(), "nope".into(), "k1".into()])
            .await
            .unwrap(),
        vec![Some(json!({"v": 1})), None, Some(json!({"v": 1}))]
    );

    let backend = DatabaseBackend::new(store.clone(), &StoreConfig::default()).unwrap();
    backend.put_events(vec![ingest("p1", "e1", 10)]).await.unwrap();
    let found = backend
        .get_entities(&[EntityId::from("p1"), EntityId::from("p1")])
        .await
        .unwrap();
    assert!(found[&EntityId::from("p1")].is_some());
}

#[tokio::test]
async fn scan_uses_byte_order_prefix_and_cursor() {
    let Some((store, _turn)) = test_store().await else {
        return;
    };

    let mut batch = WriteBatch::new();
    for key in ["a/2", "a/10", "a/B", "a/b", "b/1"] {
        batch.put("t", key, json!(key));
    }
    batch.put("other", "a/0", json!("hidden"));
    store.commit(batch).await.unwrap();

    let keys = |entries: Vec<(String, serde_json::Value)>| {
        entries.into_iter().map(|(k, _)| k).collect::<Vec<_>>()
    };

    let all = store.scan("t", &ScanRange::prefix("a/")).await.unwrap();
    assert_eq!(keys(all), vec!["a/10", "a/2", "a/B", "a/b"]);

    let page = store
        .scan("t", &ScanRange::prefix("a/").after("a/2").limit(1))
        .await
        .unwrap();
    assert_eq!(keys(page), vec!["a/B"]);
}

#[tokio::test]
async fn failed_guard_rolls_back_the_batch() {
    let Some((store, _turn)) = test_store().await else {
        return;
    };

    let mut seed = WriteBatch::new();
    seed.put("t", "rec", json!({"version": "v1"}));
    store.commit(seed).await.unwrap();

    let mut batch = WriteBatch::new();
    batch.put("t", "side", json!(true));
    batch.guard("t", "rec", "version", Some(json!("v0")));
    batch.put("t", "rec", json!({"version": "v2"}));
    let err = store.commit(batch).await.unwrap_err();

    assert!(matches!(err, CommitError::GuardFailed { .. }));
    assert_eq!(store.get("t", "side").await.unwrap(), None);
    assert_eq!(store.get("t", "rec").await.unwrap(), Some(json!({"version": "v1"})));
}

// =========================================================================
// Backend over Postgres
// =========================================================================

#[tokio::test]
async fn backend_round_trips_through_postgres() {
    let Some((store, _turn)) = test_store().await else {
        return;
    };
    let backend = DatabaseBackend::new(store.clone(), &StoreConfig::default()).unwrap();

    assert_eq!(
        backend
            .put_events(vec![ingest("p1", "e1", 10), ingest("p2", "e2", 20)])
            .await
            .unwrap(),
        2
    );

    let found = backend
        .get_entities(&[EntityId::from("p1"), EntityId::from("p2")])
        .await
        .unwrap();
    assert!(found.values().all(Option::is_some));

    let due = backend.list_due_components(15, None).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].task_id, EntityId::from("p1"));

    assert_eq!(store.scan(ENTITIES_TABLE, &ScanRange::all()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn stale_version_guard_fails_after_rival_write() {
    let Some((store, _turn)) = test_store().await else {
        return;
    };
    let backend = DatabaseBackend::new(store.clone(), &StoreConfig::default()).unwrap();
    backend.put_events(vec![ingest("p1", "e1", 10)]).await.unwrap();

    // A second backend has its own locks; only the row guard orders the two.
    let rival = DatabaseBackend::new(store.clone(), &StoreConfig::default()).unwrap();
    rival
        .put_events(vec![
            Event::new(EntityId::from("p1"), 20, EventPayload::TaskUpdateDeleted).with_id("e2"),
        ])
        .await
        .unwrap();

    let mut batch = WriteBatch::new();
    batch.guard(ENTITIES_TABLE, "p1", "last_event_id", Some(json!("e1")));
    batch.put(ENTITIES_TABLE, "p1", json!({}));
    assert!(matches!(
        store.commit(batch).await.unwrap_err(),
        CommitError::GuardFailed { .. }
    ));

    let record = backend.get_entities(&[EntityId::from("p1")]).await.unwrap()
        [&EntityId::from("p1")]
        .clone()
        .unwrap();
    assert!(record.entity.is_deleted());
    assert!(backend.list_due_components(i64::MAX, None).await.unwrap().is_empty());
}
