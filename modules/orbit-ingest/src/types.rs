use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use orbit_world::{TaskContent, TaskProvenance};

/// A collection of items from one place, e.g. a notes file or a deck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IngestibleSource {
    /// Stable identifier of the source. Becomes the task provenance identifier.
    pub identifier: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub items: Vec<IngestibleItem>,
}

impl IngestibleSource {
    pub fn new(identifier: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            url: None,
            color: None,
            items: Vec::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_item(mut self, item: IngestibleItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn provenance(&self) -> TaskProvenance {
        TaskProvenance {
            identifier: self.identifier.clone(),
            title: self.title.clone(),
            url: self.url.clone(),
            color: self.color.clone(),
        }
    }
}

/// One prompt inside a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IngestibleItem {
    /// Unique within its source and stable across re-ingestion. Moving an
    /// item to another source keeps the identifier.
    pub identifier: String,
    pub content: TaskContent,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl IngestibleItem {
    pub fn new(identifier: impl Into<String>, content: TaskContent) -> Self {
        Self {
            identifier: identifier.into(),
            content,
            metadata: BTreeMap::new(),
        }
    }
}
