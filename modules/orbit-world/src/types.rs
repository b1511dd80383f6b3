use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// Component id used by tasks that have exactly one schedulable part.
pub const MAIN_COMPONENT_ID: &str = "main";

/// Metadata key holding the ingestion item identifier of an ingested task.
pub const INGEST_ITEM_IDENTIFIER_KEY: &str = "ingest.item_identifier";

// --- Entities ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::Task => write!(f, "task"),
        }
    }
}

/// Folded state of every event sharing an entity id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum Entity {
    Task(Task),
}

impl Entity {
    pub fn id(&self) -> &EntityId {
        match self {
            Entity::Task(task) => &task.id,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Task(_) => EntityType::Task,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Entity::Task(task) => task.is_deleted,
        }
    }

    pub fn as_task(&self) -> Option<&Task> {
        match self {
            Entity::Task(task) => Some(task),
        }
    }

    /// Provenance source identifier, if the entity came from an ingestible source.
    pub fn provenance_identifier(&self) -> Option<&str> {
        match self {
            Entity::Task(task) => task.provenance.as_ref().map(|p| p.identifier.as_str()),
        }
    }
}

/// A learning item with one or more independently scheduled components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    pub id: EntityId,
    pub created_at_millis: i64,
    pub content: TaskContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<TaskProvenance>,
    /// Keyed by component id. Always matches `content.component_ids()`.
    pub component_states: BTreeMap<String, TaskComponentState>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Task {
    pub fn item_identifier(&self) -> Option<&str> {
        self.metadata
            .get(INGEST_ITEM_IDENTIFIER_KEY)
            .map(String::as_str)
    }
}

// --- Content ---

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct TaskContentField {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl TaskContentField {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// One contiguous deleted span of a cloze body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClozeRange {
    pub start_index: usize,
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// A cloze deletion. Each one is reviewed and scheduled on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClozeComponent {
    pub order: u32,
    pub ranges: Vec<ClozeRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskContent {
    Plain {
        body: TaskContentField,
    },
    Qa {
        body: TaskContentField,
        answer: TaskContentField,
    },
    Cloze {
        body: TaskContentField,
        components: BTreeMap<String, ClozeComponent>,
    },
}

impl TaskContent {
    /// The schedulable components this content defines, in key order.
    pub fn component_ids(&self) -> Vec<String> {
        match self {
            TaskContent::Plain { .. } | TaskContent::Qa { .. } => {
                vec![MAIN_COMPONENT_ID.to_string()]
            }
            TaskContent::Cloze { components, .. } => components.keys().cloned().collect(),
        }
    }
}

// --- Provenance ---

/// Where an ingested task came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskProvenance {
    /// Stable identifier of the ingestible source (e.g. a note file's id).
    pub identifier: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

// --- Scheduling ---

/// Spaced-repetition state after at least one review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SchedulingState {
    pub interval_millis: i64,
    pub due_timestamp_millis: i64,
    pub last_repetition_timestamp_millis: i64,
    pub repetition_count: u32,
    pub lapse_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskComponentState {
    pub created_at_millis: i64,
    pub due_timestamp_millis: i64,
    /// None until the component's first repetition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<SchedulingState>,
}

impl TaskComponentState {
    /// A fresh component, due as soon as it exists.
    pub fn new(created_at_millis: i64) -> Self {
        Self {
            created_at_millis,
            due_timestamp_millis: created_at_millis,
            scheduling: None,
        }
    }
}
