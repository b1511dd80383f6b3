//! Storage-level types: entity records, transaction inputs, queries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use orbit_world::{Entity, EntityId, EntityType, Event, EventId};

/// Version-stamp field the commit guard compares.
pub const VERSION_FIELD: &str = "last_event_id";

/// An entity plus the fingerprint of the last event folded into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: Entity,
    pub last_event_id: EventId,
    pub last_event_timestamp_millis: i64,
}

impl EntityRecord {
    pub fn id(&self) -> &EntityId {
        self.entity.id()
    }

    /// Whether `event` sorts after the last event folded into this record.
    pub fn precedes(&self, event: &Event) -> bool {
        (self.last_event_timestamp_millis, &self.last_event_id) < (event.timestamp_millis, &event.id)
    }
}

/// Current records of the entities a transaction locked.
pub type EntityMap = BTreeMap<EntityId, EntityRecord>;

/// What a transform wants committed for one entity.
#[derive(Debug, Clone)]
pub struct Modification {
    pub record: EntityRecord,
    /// Events that produced `record`. Appended to the log in the same commit.
    pub events: Vec<Event>,
}

impl Modification {
    /// Build a modification from an entity and the events folded into it.
    ///
    /// The fingerprint is taken from the last event, or carried over from
    /// `previous` when there are no new events.
    pub fn new(entity: Entity, events: Vec<Event>, previous: Option<&EntityRecord>) -> Option<Self> {
        let (last_event_id, last_event_timestamp_millis) = match events.last() {
            Some(last) => (last.id.clone(), last.timestamp_millis),
            None => {
                let previous = previous?;
                (
                    previous.last_event_id.clone(),
                    previous.last_event_timestamp_millis,
                )
            }
        };
        Some(Self {
            record: EntityRecord {
                entity,
                last_event_id,
                last_event_timestamp_millis,
            },
            events,
        })
    }
}

/// Filter for `DatabaseBackend::list_entities`.
///
/// Results come back in id order. Pass the last id seen as `after` to fetch
/// the next page; no cursor is held between calls.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EntityQuery {
    #[builder(default = EntityType::Task)]
    pub entity_type: EntityType,
    #[builder(default, setter(strip_option, into))]
    pub provenance_identifier: Option<String>,
    #[builder(default, setter(strip_option))]
    pub after: Option<EntityId>,
    #[builder(default, setter(strip_option))]
    pub limit: Option<usize>,
    #[builder(default)]
    pub include_deleted: bool,
}

impl EntityQuery {
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.entity_type() == self.entity_type
            && (self.include_deleted || !entity.is_deleted())
            && self
                .provenance_identifier
                .as_deref()
                .map_or(true, |id| entity.provenance_identifier() == Some(id))
    }
}

impl Default for EntityQuery {
    fn default() -> Self {
        Self::builder().build()
    }
}
