//! DatabaseBackend, the only write path for entities, events and derived rows.
//!
//! Every mutation goes through one shape of transaction:
//!   1. Lock the entity ids (sorted, waiting on contention)
//!   2. Read their current records
//!   3. Fold new events / run the caller's transform
//!   4. Project entity transitions into derived-row deltas
//!   5. Commit records + derived rows + events in one guarded batch
//!
//! Nothing is written before step 5. A transaction that errors or is dropped
//! part-way leaves the substrate untouched.

use std::collections::{BTreeMap, BTreeSet};

use futures::{stream, Stream, StreamExt, TryStreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use orbit_common::{OrbitError, Result, StoreConfig};
use orbit_engine::projector::{sortable_millis, DUE_BY_TIME_TABLE, DUE_TASK_COMPONENTS_TABLE};
use orbit_engine::{project, rows_for, sort_events, DueComponentRow, EntityReducer, Scheduler};
use orbit_world::{Entity, EntityId, Event, EventId};

use crate::locks::{EntityLocks, LockSet};
use crate::substrate::{
    CommitError, ScanRange, Substrate, WriteBatch, ENTITIES_TABLE, EVENTS_BY_ENTITY_TABLE,
    EVENTS_TABLE,
};
use crate::types::{EntityMap, EntityQuery, EntityRecord, Modification, VERSION_FIELD};

const DEFAULT_SCAN_PAGE_SIZE: usize = 256;

pub struct DatabaseBackend<S> {
    substrate: S,
    reducer: EntityReducer,
    locks: EntityLocks,
    scan_page_size: usize,
}

impl<S: Substrate> DatabaseBackend<S> {
    pub fn new(substrate: S, config: &StoreConfig) -> Result<Self> {
        let scheduler = Scheduler::new(config.scheduler)?;
        Ok(Self::with_reducer(substrate, EntityReducer::new(scheduler)))
    }

    pub fn with_reducer(substrate: S, reducer: EntityReducer) -> Self {
        Self {
            substrate,
            reducer,
            locks: EntityLocks::new(),
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }

    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size.max(1);
        self
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn reducer(&self) -> &EntityReducer {
        &self.reducer
    }

    // =================================================================
    // Reads (committed state only)
    // =================================================================

    /// Point lookup. Every requested id is present in the result.
    pub async fn get_entities(
        &self,
        ids: &[EntityId],
    ) -> Result<BTreeMap<EntityId, Option<EntityRecord>>> {
        let keys: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let values = self.substrate.get_many(ENTITIES_TABLE, &keys).await?;

        ids.iter()
            .zip(values)
            .map(|(id, value)| {
                let record = value.map(serde_json::from_value).transpose()?;
                Ok((id.clone(), record))
            })
            .collect()
    }

    /// Entities matching `query`, in id order, fetched a page at a time as
    /// the stream is polled.
    pub fn entity_stream<'a>(
        &'a self,
        query: &'a EntityQuery,
    ) -> impl Stream<Item = Result<Entity>> + Send + 'a {
        let substrate = &self.substrate;
        let page_size = self.scan_page_size;
        let start = query.after.as_ref().map(|id| id.as_str().to_string());

        // State: None once the table is exhausted, otherwise the key to resume after.
        stream::try_unfold(Some(start), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok::<_, OrbitError>(None);
            };
            let mut range = ScanRange::all().limit(page_size);
            if let Some(after) = after {
                range = range.after(after);
            }
            let page = substrate.scan(ENTITIES_TABLE, &range).await?;

            let next = if page.len() < page_size {
                None
            } else {
                page.last().map(|(key, _)| Some(key.clone()))
            };

            let mut entities = Vec::with_capacity(page.len());
            for (_, value) in page {
                let record: EntityRecord = serde_json::from_value(value)?;
                if query.matches(&record.entity) {
                    entities.push(record.entity);
                }
            }
            Ok(Some((entities, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Entity, OrbitError>)))
        .try_flatten()
        .take(query.limit.unwrap_or(usize::MAX))
    }

    pub async fn list_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        self.entity_stream(query).try_collect().await
    }

    /// Components due at or before `before_timestamp_millis`, soonest first,
    /// ties broken by `task/component` key.
    ///
    /// Walks the due-time index from the start and stops at the first row
    /// past the cutoff.
    pub async fn list_due_components(
        &self,
        before_timestamp_millis: i64,
        limit: Option<usize>,
    ) -> Result<Vec<DueComponentRow>> {
        let mut due = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let want = match limit {
                Some(limit) => (limit - due.len()).min(self.scan_page_size),
                None => self.scan_page_size,
            };
            if want == 0 {
                break;
            }
            let mut range = ScanRange::all().limit(want);
            if let Some(key) = after.take() {
                range = range.after(key);
            }
            let page = self.substrate.scan(DUE_BY_TIME_TABLE, &range).await?;
            let exhausted = page.len() < want;
            after = page.last().map(|(key, _)| key.clone());

            for (_, value) in page {
                let row: DueComponentRow = serde_json::from_value(value)?;
                if row.due_timestamp_millis > before_timestamp_millis {
                    return Ok(due);
                }
                due.push(row);
            }
            if exhausted {
                break;
            }
        }
        Ok(due)
    }

    /// The stored log of one entity, in fold order.
    pub async fn list_events(&self, entity_id: &EntityId) -> Result<Vec<Event>> {
        let index = self
            .substrate
            .scan(EVENTS_BY_ENTITY_TABLE, &ScanRange::prefix(entity_prefix(entity_id)))
            .await?;
        let ids: Vec<String> = index
            .into_iter()
            .filter_map(|(_, value)| value.as_str().map(str::to_string))
            .collect();

        let mut events = Vec::with_capacity(ids.len());
        for (id, value) in ids.iter().zip(self.substrate.get_many(EVENTS_TABLE, &ids).await?) {
            let Some(value) = value else {
                warn!(entity_id = %entity_id, event_id = id.as_str(), "Indexed event missing");
                continue;
            };
            let event: Event = serde_json::from_value(value)?;
            if &event.entity_id != entity_id {
                warn!(
                    entity_id = %entity_id,
                    event_id = id.as_str(),
                    owner = %event.entity_id,
                    "Index entry points at another entity's event"
                );
                continue;
            }
            events.push(event);
        }
        // Index keys sort by (timestamp, id) already; this guards hand-written keys.
        sort_events(&mut events);
        Ok(events)
    }

    // =================================================================
    // Writes
    // =================================================================

    /// Run `transform` over the current records of `ids` while holding their
    /// locks, then commit what it returns.
    ///
    /// The transform sees every locked id that has a record. It may return
    /// modifications for ids it did not lock; those are read fresh and
    /// guarded by their version stamp, so a concurrent writer turns into a
    /// `ConcurrencyConflict` rather than a lost update.
    pub async fn modify_entities<F>(&self, ids: &[EntityId], transform: F) -> Result<()>
    where
        F: FnOnce(&EntityMap) -> Result<BTreeMap<EntityId, Modification>> + Send,
    {
        let locked = self.locks.acquire(ids.iter().cloned()).await;
        let before = self.read_records(locked.ids()).await?;
        let modifications = transform(&before)?;
        self.commit_modifications(&locked, &before, modifications).await
    }

    /// Append events for one entity and fold them in.
    pub async fn store_events(&self, entity_id: &EntityId, events: Vec<Event>) -> Result<()> {
        if let Some(stray) = events.iter().find(|e| &e.entity_id != entity_id) {
            return Err(OrbitError::invalid_sequence(
                entity_id,
                format!("event {} targets entity {}", stray.id, stray.entity_id),
            ));
        }
        self.put_events(events).await.map(|_| ())
    }

    /// Append events for any number of entities in one transaction.
    ///
    /// Events already in the log are skipped, so redelivery is harmless.
    /// An event that sorts before an entity's last folded event triggers a
    /// full replay of that entity's log. Returns the number of new events.
    pub async fn put_events(&self, events: Vec<Event>) -> Result<usize> {
        let mut by_entity: BTreeMap<EntityId, Vec<Event>> = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for event in events {
            if seen.insert(event.id.clone()) {
                by_entity.entry(event.entity_id.clone()).or_default().push(event);
            }
        }
        if by_entity.is_empty() {
            return Ok(0);
        }
        for entity_id in by_entity.keys() {
            check_entity_id(entity_id)?;
        }

        let locked = self.locks.acquire(by_entity.keys().cloned()).await;
        let before = self.read_records(locked.ids()).await?;

        let mut modifications = BTreeMap::new();
        for (entity_id, events) in by_entity {
            // Checked under the lock so concurrent redelivery can't fold twice.
            let known = self.known_event_ids(&events).await?;
            let mut new_events: Vec<Event> = events
                .into_iter()
                .filter(|event| {
                    let fresh = !known.contains(&event.id);
                    if !fresh {
                        debug!(event_id = %event.id, "Skipping already-stored event");
                    }
                    fresh
                })
                .collect();
            sort_events(&mut new_events);
            let Some(first) = new_events.first() else {
                continue;
            };

            let (entity, last) = match before.get(&entity_id) {
                Some(record) if !record.precedes(first) => {
                    info!(
                        entity_id = %entity_id,
                        event_id = %first.id,
                        "Late event, replaying entity log"
                    );
                    let mut all = self.list_events(&entity_id).await?;
                    all.extend(new_events.iter().cloned());
                    sort_events(&mut all);
                    (self.reducer.reduce(None, &all)?, all.last().cloned())
                }
                Some(record) => (
                    self.reducer.reduce(Some(record.entity.clone()), &new_events)?,
                    new_events.last().cloned(),
                ),
                None => (
                    self.reducer.reduce(None, &new_events)?,
                    new_events.last().cloned(),
                ),
            };
            let Some(last) = last else {
                continue;
            };

            modifications.insert(
                entity_id,
                Modification {
                    record: EntityRecord {
                        entity,
                        last_event_id: last.id,
                        last_event_timestamp_millis: last.timestamp_millis,
                    },
                    events: new_events,
                },
            );
        }

        let appended = modifications.values().map(|m| m.events.len()).sum();
        self.commit_modifications(&locked, &before, modifications).await?;
        Ok(appended)
    }

    /// Re-fold an entity from its stored log and rewrite its record and
    /// derived rows from scratch. Returns None if the entity has no events.
    pub async fn rebuild_entity(&self, entity_id: &EntityId) -> Result<Option<EntityRecord>> {
        let _locked = self.locks.acquire([entity_id.clone()]).await;
        let events = self.list_events(entity_id).await?;
        let Some(last) = events.last() else {
            return Ok(None);
        };

        let entity = self.reducer.reduce(None, &events)?;
        let record = EntityRecord {
            entity,
            last_event_id: last.id.clone(),
            last_event_timestamp_millis: last.timestamp_millis,
        };
        let previous = self.substrate.get(ENTITIES_TABLE, entity_id.as_str()).await?;

        let mut batch = WriteBatch::new();
        batch.guard(
            ENTITIES_TABLE,
            entity_id.as_str(),
            VERSION_FIELD,
            previous.as_ref().and_then(|v| v.get(VERSION_FIELD)).cloned(),
        );
        batch.put(ENTITIES_TABLE, entity_id.as_str(), serde_json::to_value(&record)?);

        // Scan rather than diff: the table may hold rows the old record never had.
        let rows = rows_for(&record.entity);
        let stored = self
            .substrate
            .scan(DUE_TASK_COMPONENTS_TABLE, &ScanRange::prefix(entity_prefix(entity_id)))
            .await?;
        for (key, value) in stored {
            let row: DueComponentRow = serde_json::from_value(value)?;
            if &row.task_id != entity_id {
                continue;
            }
            batch.delete(DUE_BY_TIME_TABLE, row.due_index_key());
            if !rows.contains_key(&row.key()) {
                batch.delete(DUE_TASK_COMPONENTS_TABLE, key);
            }
        }
        for row in rows.values() {
            put_row(&mut batch, row)?;
        }

        self.commit(batch).await?;
        info!(entity_id = %entity_id, events = events.len(), rows = rows.len(), "Rebuilt entity");
        Ok(Some(record))
    }

    // =================================================================
    // Internals
    // =================================================================

    async fn read_records<'a, I>(&self, ids: I) -> Result<EntityMap>
    where
        I: IntoIterator<Item = &'a EntityId>,
    {
        let ids: Vec<EntityId> = ids.into_iter().cloned().collect();
        let found = self.get_entities(&ids).await?;
        Ok(found
            .into_iter()
            .filter_map(|(id, record)| record.map(|r| (id, r)))
            .collect())
    }

    async fn known_event_ids(&self, events: &[Event]) -> Result<BTreeSet<EventId>> {
        let keys: Vec<String> = events.iter().map(|e| e.id.as_str().to_string()).collect();
        let found = self.substrate.get_many(EVENTS_TABLE, &keys).await?;
        Ok(events
            .iter()
            .zip(found)
            .filter(|(_, value)| value.is_some())
            .map(|(event, _)| event.id.clone())
            .collect())
    }

    async fn commit_modifications(
        &self,
        locked: &LockSet,
        before: &EntityMap,
        modifications: BTreeMap<EntityId, Modification>,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        let mut changed = 0usize;
        let mut appended = 0usize;

        for (entity_id, modification) in modifications {
            check_entity_id(&entity_id)?;
            if modification.record.id() != &entity_id {
                return Err(OrbitError::invalid_sequence(
                    &entity_id,
                    format!("modification carries entity {}", modification.record.id()),
                ));
            }

            let unlocked;
            let previous = if locked.contains(&entity_id) {
                before.get(&entity_id)
            } else {
                unlocked = self.read_records([&entity_id]).await?;
                unlocked.get(&entity_id)
            };

            if previous == Some(&modification.record) && modification.events.is_empty() {
                continue;
            }

            let expected = previous
                .map(|p| serde_json::to_value(&p.last_event_id))
                .transpose()?;
            batch.guard(ENTITIES_TABLE, entity_id.as_str(), VERSION_FIELD, expected);
            batch.put(
                ENTITIES_TABLE,
                entity_id.as_str(),
                serde_json::to_value(&modification.record)?,
            );

            let previous_entity = previous.map(|p| &p.entity);
            if previous_entity != Some(&modification.record.entity) {
                let delta = project(previous_entity, &modification.record.entity);
                if !delta.is_empty() {
                    debug!(
                        entity_id = %entity_id,
                        upserts = delta.upserts.len(),
                        deletes = delta.deletes.len(),
                        "Projected derived rows"
                    );
                }
                for row in &delta.deletes {
                    batch.delete(DUE_TASK_COMPONENTS_TABLE, row.key().storage_key());
                    batch.delete(DUE_BY_TIME_TABLE, row.due_index_key());
                }
                for row in &delta.upserts {
                    put_row(&mut batch, row)?;
                }
                changed += 1;
            }

            for event in &modification.events {
                batch.put(EVENTS_TABLE, event.id.as_str(), serde_json::to_value(event)?);
                batch.put(
                    EVENTS_BY_ENTITY_TABLE,
                    event_index_key(event),
                    Value::String(event.id.as_str().to_string()),
                );
            }
            appended += modification.events.len();
        }

        if batch.is_empty() {
            return Ok(());
        }
        self.commit(batch).await?;
        debug!(changed, appended, "Committed entity transaction");
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        match self.substrate.commit(batch).await {
            Ok(()) => Ok(()),
            Err(CommitError::GuardFailed { key, .. }) => {
                warn!(entity_id = key.as_str(), "Entity changed outside its lock");
                Err(OrbitError::ConcurrencyConflict {
                    entity_id: EntityId::new(key),
                })
            }
            Err(CommitError::Storage(e)) => Err(OrbitError::Storage(e)),
        }
    }
}

fn check_entity_id(entity_id: &EntityId) -> Result<()> {
    if entity_id.is_storable() {
        Ok(())
    } else {
        Err(OrbitError::InvalidEntityId {
            entity_id: entity_id.clone(),
        })
    }
}

fn entity_prefix(entity_id: &EntityId) -> String {
    format!("{entity_id}/")
}

/// `<entity>/<sortable timestamp>/<event id>`. Scans come back in fold order.
fn event_index_key(event: &Event) -> String {
    format!(
        "{}/{}/{}",
        event.entity_id,
        sortable_millis(event.timestamp_millis),
        event.id
    )
}

/// Write a row to both derived tables.
fn put_row(batch: &mut WriteBatch, row: &DueComponentRow) -> Result<()> {
    let value = serde_json::to_value(row)?;
    batch.put(DUE_BY_TIME_TABLE, row.due_index_key(), value.clone());
    batch.put(DUE_TASK_COMPONENTS_TABLE, row.key().storage_key(), value);
    Ok(())
}
