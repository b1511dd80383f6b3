//! The storage contract the backend is written against.
//!
//! An ordered key-value table per name, point reads, ordered prefix scans,
//! and all-or-nothing batch commits with compare-and-swap guards checked
//! inside the commit.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub const EVENTS_TABLE: &str = "events";
pub const EVENTS_BY_ENTITY_TABLE: &str = "events_by_entity";
pub const ENTITIES_TABLE: &str = "entities";

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

/// Keys to visit in a scan, in ascending byte order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRange {
    /// Only keys starting with this prefix.
    pub prefix: String,
    /// Only keys strictly greater than this one.
    pub after: Option<String>,
    pub limit: Option<usize>,
}

impl ScanRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn after(mut self, key: impl Into<String>) -> Self {
        self.after = Some(key.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn admits(&self, key: &str) -> bool {
        key.starts_with(&self.prefix) && self.after.as_deref().map_or(true, |after| key > after)
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        table: String,
        key: String,
        value: Value,
    },
    Delete {
        table: String,
        key: String,
    },
}

/// A compare-and-swap precondition on one record.
///
/// `expected: None` requires the record to be absent. Otherwise the record
/// must exist and its top-level `field` must equal `expected`.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    pub table: String,
    pub key: String,
    pub field: String,
    pub expected: Option<Value>,
}

impl Guard {
    pub fn holds(&self, current: Option<&Value>) -> bool {
        match (&self.expected, current) {
            (None, None) => true,
            (Some(expected), Some(record)) => record.get(&self.field) == Some(expected),
            _ => false,
        }
    }
}

/// Staged writes. Nothing reaches the substrate until `Substrate::commit`.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    guards: Vec<Guard>,
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(
        &mut self,
        table: &str,
        key: impl Into<String>,
        field: &str,
        expected: Option<Value>,
    ) {
        self.guards.push(Guard {
            table: table.to_string(),
            key: key.into(),
            field: field.to_string(),
            expected,
        });
    }

    pub fn put(&mut self, table: &str, key: impl Into<String>, value: Value) {
        self.ops.push(WriteOp::Put {
            table: table.to_string(),
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, table: &str, key: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            table: table.to_string(),
            key: key.into(),
        });
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("guard failed on {table}/{key}")]
    GuardFailed { table: String, key: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Substrate
// ---------------------------------------------------------------------------

/// Ordered, durable key-value tables with atomic multi-table commits.
///
/// Readers only ever observe committed batches.
#[async_trait]
pub trait Substrate: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>>;

    async fn get_many(&self, table: &str, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(table, key).await?);
        }
        Ok(values)
    }

    /// Entries in ascending key order.
    async fn scan(&self, table: &str, range: &ScanRange) -> Result<Vec<(String, Value)>>;

    /// Check every guard, then apply every op. All or nothing.
    async fn commit(&self, batch: WriteBatch) -> Result<(), CommitError>;
}

#[async_trait]
impl<S: Substrate + ?Sized> Substrate for Arc<S> {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        (**self).get(table, key).await
    }

    async fn get_many(&self, table: &str, keys: &[String]) -> Result<Vec<Option<Value>>> {
        (**self).get_many(table, keys).await
    }

    async fn scan(&self, table: &str, range: &ScanRange) -> Result<Vec<(String, Value)>> {
        (**self).scan(table, range).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), CommitError> {
        (**self).commit(batch).await
    }
}
