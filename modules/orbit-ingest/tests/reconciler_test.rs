//! Reconciliation against a live in-memory store.

use std::sync::Arc;

use orbit_common::StoreConfig;
use orbit_events::{DatabaseBackend, EntityQuery, MemoryStore};
use orbit_ingest::{IngestibleItem, IngestibleSource, Reconciler};
use orbit_world::{Entity, Event, EventPayload, Task, TaskContent, TaskContentField};

fn backend() -> DatabaseBackend<Arc<MemoryStore>> {
    DatabaseBackend::new(Arc::new(MemoryStore::new()), &StoreConfig::default()).unwrap()
}

fn qa(question: &str, answer: &str) -> TaskContent {
    TaskContent::Qa {
        body: TaskContentField::text(question),
        answer: TaskContentField::text(answer),
    }
}

fn item(identifier: &str) -> IngestibleItem {
    IngestibleItem::new(identifier, qa(identifier, "answer"))
}

fn source(identifier: &str, items: &[&str]) -> IngestibleSource {
    items
        .iter()
        .fold(IngestibleSource::new(identifier, identifier.to_uppercase()), |s, i| {
            s.with_item(item(i))
        })
}

async fn live_tasks(backend: &DatabaseBackend<Arc<MemoryStore>>) -> Vec<Task> {
    backend
        .list_entities(&EntityQuery::default())
        .await
        .unwrap()
        .into_iter()
        .map(|Entity::Task(task)| task)
        .collect()
}

fn task_for<'a>(tasks: &'a [Task], item: &str) -> &'a Task {
    tasks
        .iter()
        .find(|t| t.item_identifier() == Some(item))
        .unwrap_or_else(|| panic!("no task for {item}"))
}

fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

/// Reconcile and store, returning the events produced.
async fn sync(
    backend: &DatabaseBackend<Arc<MemoryStore>>,
    sources: &[IngestibleSource],
    now: i64,
) -> Vec<Event> {
    let events = Reconciler::new(backend).reconcile(sources, now).await.unwrap();
    backend.put_events(events.clone()).await.unwrap();
    events
}

// =========================================================================
// Round trip
// =========================================================================

#[tokio::test]
async fn first_ingest_creates_every_item() {
    let backend = backend();
    let events = sync(&backend, &[source("notes", &["a", "b"])], 100).await;
    assert_eq!(kinds(&events), vec!["task_ingest", "task_ingest"]);
    assert!(events.iter().all(|e| e.timestamp_millis == 100));

    let tasks = live_tasks(&backend).await;
    assert_eq!(tasks.len(), 2);
    let a = task_for(&tasks, "a");
    assert_eq!(a.provenance.as_ref().unwrap().identifier, "notes");
    assert_eq!(a.provenance.as_ref().unwrap().title, "NOTES");
}

#[tokio::test]
async fn reingest_deletes_missing_and_adds_new() {
    let backend = backend();
    sync(&backend, &[source("notes", &["a", "b"])], 100).await;
    let before = live_tasks(&backend).await;
    let a_id = task_for(&before, "a").id.clone();
    let b_id = task_for(&before, "b").id.clone();

    let events = sync(&backend, &[source("notes", &["b", "c"])], 200).await;
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0].payload, EventPayload::TaskUpdateDeleted));
    assert_eq!(events[0].entity_id, a_id);
    match &events[1].payload {
        EventPayload::TaskIngest { metadata, .. } => {
            assert_eq!(metadata["ingest.item_identifier"], "c");
        }
        other => panic!("expected ingest, got {other:?}"),
    }
    assert!(events.iter().all(|e| e.entity_id != b_id));

    let after = live_tasks(&backend).await;
    let mut items: Vec<&str> = after.iter().filter_map(|t| t.item_identifier()).collect();
    items.sort();
    assert_eq!(items, vec!["b", "c"]);
}

#[tokio::test]
async fn unchanged_sources_produce_nothing() {
    let backend = backend();
    let sources = [source("notes", &["a", "b"]), source("deck", &["z"])];
    sync(&backend, &sources, 100).await;
    let events = Reconciler::new(&backend).reconcile(&sources, 200).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn unlisted_sources_are_left_alone() {
    let backend = backend();
    sync(&backend, &[source("notes", &["a"]), source("deck", &["z"])], 100).await;
    let events = Reconciler::new(&backend)
        .reconcile(&[source("notes", &["a"])], 200)
        .await
        .unwrap();
    assert!(events.is_empty());
}

// =========================================================================
// Moves
// =========================================================================

#[tokio::test]
async fn item_moved_between_sources_keeps_its_task() {
    let backend = backend();
    sync(&backend, &[source("inbox", &["x", "y"]), source("archive", &[])], 100).await;
    let x_id = task_for(&live_tasks(&backend).await, "x").id.clone();

    let events = sync(&backend, &[source("inbox", &["y"]), source("archive", &["x"])], 200).await;

    let for_x: Vec<&Event> = events.iter().filter(|e| e.entity_id == x_id).collect();
    assert_eq!(events.len(), 1, "unexpected events: {:?}", kinds(&events));
    assert_eq!(for_x.len(), 1);
    match &for_x[0].payload {
        EventPayload::TaskUpdateProvenance { provenance } => {
            assert_eq!(provenance.as_ref().unwrap().identifier, "archive");
        }
        other => panic!("expected provenance update, got {other:?}"),
    }

    let tasks = live_tasks(&backend).await;
    let x = task_for(&tasks, "x");
    assert_eq!(x.id, x_id);
    assert_eq!(x.provenance.as_ref().unwrap().identifier, "archive");
}

#[tokio::test]
async fn moved_item_with_new_content_also_updates_content() {
    let backend = backend();
    sync(&backend, &[source("inbox", &["x"])], 100).await;

    let edited = IngestibleSource::new("archive", "Archive")
        .with_item(IngestibleItem::new("x", qa("x", "a better answer")));
    let events = sync(&backend, &[source("inbox", &[]), edited], 200).await;
    assert_eq!(kinds(&events), vec!["task_update_provenance", "task_update_content"]);

    let tasks = live_tasks(&backend).await;
    assert_eq!(task_for(&tasks, "x").content, qa("x", "a better answer"));
}

// =========================================================================
// Drift
// =========================================================================

#[tokio::test]
async fn edited_item_updates_content_in_place() {
    let backend = backend();
    sync(&backend, &[source("notes", &["a"])], 100).await;
    let a_id = task_for(&live_tasks(&backend).await, "a").id.clone();

    let edited = IngestibleSource::new("notes", "NOTES")
        .with_item(IngestibleItem::new("a", qa("a", "revised")));
    let events = sync(&backend, &[edited], 200).await;
    assert_eq!(kinds(&events), vec!["task_update_content"]);
    assert_eq!(events[0].entity_id, a_id);
}

#[tokio::test]
async fn item_metadata_naming_the_identifier_key_does_not_churn() {
    let backend = backend();
    let mut stray = item("a");
    stray
        .metadata
        .insert(orbit_world::INGEST_ITEM_IDENTIFIER_KEY.into(), "other".into());
    let sources = [IngestibleSource::new("notes", "NOTES").with_item(stray)];

    let first = sync(&backend, &sources, 100).await;
    assert_eq!(kinds(&first), vec!["task_ingest"]);
    let a_id = task_for(&live_tasks(&backend).await, "a").id.clone();

    for now in [200, 300] {
        let events = sync(&backend, &sources, now).await;
        assert!(events.is_empty(), "round at {now} produced {:?}", kinds(&events));
    }
    assert_eq!(task_for(&live_tasks(&backend).await, "a").id, a_id);
}

#[tokio::test]
async fn renamed_source_updates_provenance() {
    let backend = backend();
    sync(&backend, &[source("notes", &["a"])], 100).await;

    let renamed = IngestibleSource::new("notes", "Reading notes")
        .with_url("https://example.com/notes")
        .with_item(item("a"));
    let events = sync(&backend, &[renamed], 200).await;
    assert_eq!(kinds(&events), vec!["task_update_provenance"]);

    let tasks = live_tasks(&backend).await;
    let provenance = task_for(&tasks, "a").provenance.clone().unwrap();
    assert_eq!(provenance.title, "Reading notes");
    assert_eq!(provenance.url.as_deref(), Some("https://example.com/notes"));
}

#[tokio::test]
async fn sources_round_trip_through_json() {
    let raw = serde_json::json!([{
        "identifier": "notes",
        "title": "Notes",
        "items": [{
            "identifier": "a",
            "content": {"type": "plain", "body": {"text": "Photosynthesis"}}
        }]
    }]);
    let sources: Vec<IngestibleSource> = serde_json::from_value(raw).unwrap();
    let backend = backend();
    let events = sync(&backend, &sources, 1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(live_tasks(&backend).await[0].id, events[0].entity_id);
}
