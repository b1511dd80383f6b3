//! The event log vocabulary: every fact a producer can append.
//!
//! Events are immutable once committed. Each variant carries only the fields
//! its merge rule needs; the reducer matches on them exhaustively.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::eventlike::Eventlike;
use crate::ids::{EntityId, EventId};
use crate::types::{TaskContent, TaskProvenance};

/// An immutable fact about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    pub id: EventId,
    pub entity_id: EntityId,
    pub timestamp_millis: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(entity_id: EntityId, timestamp_millis: i64, payload: EventPayload) -> Self {
        Self {
            id: EventId::generate(),
            entity_id,
            timestamp_millis,
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = id.into();
        self
    }

    /// The total order events are folded in: timestamp first, then id.
    pub fn log_order(&self, other: &Event) -> Ordering {
        self.timestamp_millis
            .cmp(&other.timestamp_millis)
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Type-specific event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A task entered the store for the first time.
    TaskIngest {
        content: TaskContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provenance: Option<TaskProvenance>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: BTreeMap<String, String>,
    },

    /// The task was deleted. Terminal.
    TaskUpdateDeleted,

    /// The task's originating source changed (or was cleared).
    TaskUpdateProvenance {
        #[serde(default)]
        provenance: Option<TaskProvenance>,
    },

    /// The task's prompt content was replaced.
    TaskUpdateContent { content: TaskContent },

    /// Metadata keys were set. Existing keys not named here are kept.
    TaskUpdateMetadata { metadata: BTreeMap<String, String> },

    /// One component was reviewed.
    TaskRepetition {
        component_id: String,
        outcome: RepetitionOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        review_session_id: Option<String>,
    },

    /// One component was moved to a new due date without being reviewed.
    TaskReschedule {
        component_id: String,
        new_due_timestamp_millis: i64,
    },
}

impl Eventlike for EventPayload {
    fn event_type(&self) -> &'static str {
        match self {
            EventPayload::TaskIngest { .. } => "task_ingest",
            EventPayload::TaskUpdateDeleted => "task_update_deleted",
            EventPayload::TaskUpdateProvenance { .. } => "task_update_provenance",
            EventPayload::TaskUpdateContent { .. } => "task_update_content",
            EventPayload::TaskUpdateMetadata { .. } => "task_update_metadata",
            EventPayload::TaskRepetition { .. } => "task_repetition",
            EventPayload::TaskReschedule { .. } => "task_reschedule",
        }
    }
}

// ---------------------------------------------------------------------------
// Review outcomes
// ---------------------------------------------------------------------------

/// How a review went. A closed set: anything else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RepetitionOutcome {
    Remembered,
    Forgotten,
}

impl RepetitionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepetitionOutcome::Remembered => "remembered",
            RepetitionOutcome::Forgotten => "forgotten",
        }
    }
}

impl fmt::Display for RepetitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A repetition outcome string outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid repetition outcome: {0:?}")]
pub struct InvalidOutcomeError(pub String);

impl FromStr for RepetitionOutcome {
    type Err = InvalidOutcomeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remembered" => Ok(RepetitionOutcome::Remembered),
            "forgotten" => Ok(RepetitionOutcome::Forgotten),
            other => Err(InvalidOutcomeError(other.to_string())),
        }
    }
}

impl TryFrom<String> for RepetitionOutcome {
    type Error = InvalidOutcomeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl JsonSchema for RepetitionOutcome {
    fn schema_name() -> String {
        "RepetitionOutcome".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            enum_values: Some(vec!["remembered".into(), "forgotten".into()]),
            ..Default::default()
        }
        .into()
    }
}

impl From<RepetitionOutcome> for String {
    fn from(outcome: RepetitionOutcome) -> Self {
        outcome.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_parses_known_values_only() {
        assert_eq!("remembered".parse(), Ok(RepetitionOutcome::Remembered));
        assert_eq!("forgotten".parse(), Ok(RepetitionOutcome::Forgotten));
        assert_eq!(
            "skipped".parse::<RepetitionOutcome>(),
            Err(InvalidOutcomeError("skipped".into()))
        );
    }

    #[test]
    fn unknown_outcome_fails_deserialization() {
        let raw = json!({
            "id": "e1",
            "entity_id": "a",
            "timestamp_millis": 10,
            "type": "task_repetition",
            "component_id": "main",
            "outcome": "meh"
        });
        let err = serde_json::from_value::<Event>(raw).unwrap_err();
        assert!(err.to_string().contains("invalid repetition outcome"));
    }

    #[test]
    fn event_serializes_flat_with_type_tag() {
        let event = Event::new(EntityId::from("a"), 5, EventPayload::TaskUpdateDeleted).with_id("e1");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"id": "e1", "entity_id": "a", "timestamp_millis": 5, "type": "task_update_deleted"})
        );
        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn log_order_breaks_timestamp_ties_by_id() {
        let a = Event::new(EntityId::from("x"), 10, EventPayload::TaskUpdateDeleted).with_id("b");
        let b = Event::new(EntityId::from("x"), 10, EventPayload::TaskUpdateDeleted).with_id("a");
        let c = Event::new(EntityId::from("x"), 9, EventPayload::TaskUpdateDeleted).with_id("z");
        assert_eq!(a.log_order(&b), Ordering::Greater);
        assert_eq!(c.log_order(&b), Ordering::Less);
    }
}
