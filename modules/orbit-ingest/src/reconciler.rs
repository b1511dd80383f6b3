//! Source-to-store diff.
//!
//! Per source, existing tasks and incoming items are keyed by item
//! identifier and compared as sets:
//!   - only incoming → ingest
//!   - only existing → delete
//!   - both → drift check (content, metadata, provenance)
//!
//! An identifier that is ingested under one source and deleted under another
//! in the same run is a move: the existing task keeps its id and gets a
//! provenance update instead.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use orbit_common::{OrbitError, Result};
use orbit_events::{DatabaseBackend, EntityQuery, Substrate};
use orbit_world::{Entity, EntityId, Event, EventPayload, Task, INGEST_ITEM_IDENTIFIER_KEY};

use crate::types::{IngestibleItem, IngestibleSource};

pub struct Reconciler<'a, S> {
    backend: &'a DatabaseBackend<S>,
}

impl<'a, S: Substrate> Reconciler<'a, S> {
    pub fn new(backend: &'a DatabaseBackend<S>) -> Self {
        Self { backend }
    }

    /// Events that bring the store in line with `sources`, all stamped
    /// `now_millis`. Sources not listed are left alone.
    pub async fn reconcile(
        &self,
        sources: &[IngestibleSource],
        now_millis: i64,
    ) -> Result<Vec<Event>> {
        let tasks: Vec<Task> = self
            .backend
            .list_entities(&EntityQuery::default())
            .await?
            .into_iter()
            .map(|Entity::Task(task)| task)
            .collect();

        let events = diff(&tasks, sources, now_millis)?;
        info!(
            sources = sources.len(),
            existing = tasks.len(),
            events = events.len(),
            "Reconciled sources"
        );
        Ok(events)
    }
}

/// The pure half of `Reconciler::reconcile`.
///
/// Output order is fixed for a given input, apart from generated ids:
/// deletes, moves, drift updates, then ingests.
pub fn diff(tasks: &[Task], sources: &[IngestibleSource], now_millis: i64) -> Result<Vec<Event>> {
    let existing = group_by_source(tasks)?;

    let mut by_identifier: BTreeMap<&str, &IngestibleSource> = BTreeMap::new();
    for source in sources {
        if by_identifier.insert(source.identifier.as_str(), source).is_some() {
            warn!(source = source.identifier.as_str(), "Source listed twice, using the last one");
        }
    }

    let mut ingests: BTreeMap<&str, Vec<(&IngestibleSource, &IngestibleItem)>> = BTreeMap::new();
    let mut deletes: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
    let mut kept: Vec<(&IngestibleSource, &IngestibleItem, &Task)> = Vec::new();

    let nothing = BTreeMap::new();
    for (source_id, source) in &by_identifier {
        let incoming = index_items(*source)?;
        let current = existing.get(source_id).unwrap_or(&nothing);

        for (key, item) in &incoming {
            if !current.contains_key(key) {
                ingests.entry(*key).or_default().push((*source, *item));
            }
        }
        for (key, task) in current {
            match incoming.get(key) {
                Some(item) => kept.push((*source, *item, *task)),
                None => deletes.entry(*key).or_default().push(*task),
            }
        }
    }

    let mut moves: Vec<(&IngestibleSource, &IngestibleItem, &Task)> = Vec::new();
    let moved: BTreeSet<&str> = ingests
        .keys()
        .filter(|key| deletes.contains_key(*key))
        .copied()
        .collect();
    for key in moved {
        let mut targets = ingests.remove(key).unwrap_or_default();
        let mut origins = deletes.remove(key).unwrap_or_default();
        let paired = targets.len().min(origins.len());
        for ((source, item), task) in targets.drain(..paired).zip(origins.drain(..paired)) {
            debug!(entity_id = %task.id, item = key, to = source.identifier.as_str(), "Item moved");
            moves.push((source, item, task));
        }
        if !targets.is_empty() {
            ingests.insert(key, targets);
        }
        if !origins.is_empty() {
            deletes.insert(key, origins);
        }
    }

    let mut events = Vec::new();

    for task in deletes.values().flatten() {
        events.push(Event::new(task.id.clone(), now_millis, EventPayload::TaskUpdateDeleted));
    }

    for (source, item, task) in &moves {
        events.push(Event::new(
            task.id.clone(),
            now_millis,
            EventPayload::TaskUpdateProvenance {
                provenance: Some(source.provenance()),
            },
        ));
        events.extend(drift(task, item, now_millis));
    }

    for (source, item, task) in &kept {
        let provenance = source.provenance();
        if task.provenance.as_ref() != Some(&provenance) {
            events.push(Event::new(
                task.id.clone(),
                now_millis,
                EventPayload::TaskUpdateProvenance {
                    provenance: Some(provenance),
                },
            ));
        }
        events.extend(drift(task, item, now_millis));
    }

    for (source, item) in ingests.values().flatten() {
        let mut metadata = item.metadata.clone();
        metadata.insert(INGEST_ITEM_IDENTIFIER_KEY.to_string(), item.identifier.clone());
        events.push(Event::new(
            EntityId::random(),
            now_millis,
            EventPayload::TaskIngest {
                content: item.content.clone(),
                provenance: Some(source.provenance()),
                metadata,
            },
        ));
    }

    Ok(events)
}

/// Live ingested tasks, keyed by source identifier then item identifier.
/// Tasks without provenance were not ingested and are skipped.
fn group_by_source(tasks: &[Task]) -> Result<BTreeMap<&str, BTreeMap<&str, &Task>>> {
    let mut groups: BTreeMap<&str, BTreeMap<&str, &Task>> = BTreeMap::new();
    for task in tasks.iter().filter(|t| !t.is_deleted) {
        let Some(provenance) = &task.provenance else {
            continue;
        };
        let identifier = task
            .item_identifier()
            .ok_or_else(|| OrbitError::MissingItemIdentifier {
                entity_id: task.id.clone(),
            })?;

        let group = groups.entry(provenance.identifier.as_str()).or_default();
        if let Some(first) = group.get(identifier) {
            warn!(
                kept = %first.id,
                ignored = %task.id,
                item = identifier,
                "Two live tasks share an item identifier"
            );
            continue;
        }
        group.insert(identifier, task);
    }
    Ok(groups)
}

fn index_items(source: &IngestibleSource) -> Result<BTreeMap<&str, &IngestibleItem>> {
    let mut items = BTreeMap::new();
    for item in &source.items {
        if items.insert(item.identifier.as_str(), item).is_some() {
            return Err(OrbitError::DuplicateItemIdentifier {
                source_identifier: source.identifier.clone(),
                identifier: item.identifier.clone(),
            });
        }
    }
    Ok(items)
}

/// Content and metadata updates for a task whose item is still present.
fn drift(task: &Task, item: &IngestibleItem, now_millis: i64) -> Vec<Event> {
    let mut events = Vec::new();
    if task.content != item.content {
        events.push(Event::new(
            task.id.clone(),
            now_millis,
            EventPayload::TaskUpdateContent {
                content: item.content.clone(),
            },
        ));
    }

    // The item identifier entry is owned by ingestion, never by the item.
    let changed: BTreeMap<String, String> = item
        .metadata
        .iter()
        .filter(|(key, _)| key.as_str() != INGEST_ITEM_IDENTIFIER_KEY)
        .filter(|(key, value)| task.metadata.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if !changed.is_empty() {
        events.push(Event::new(
            task.id.clone(),
            now_millis,
            EventPayload::TaskUpdateMetadata { metadata: changed },
        ));
    }
    events
}
