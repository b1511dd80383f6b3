//! MemoryStore: in-process substrate for tests and embedded use.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::substrate::{CommitError, ScanRange, Substrate, WriteBatch, WriteOp};

type Table = BTreeMap<String, Value>;

/// Ordered tables behind one lock. A commit holds the write lock for its
/// guard checks and all of its ops, so readers see whole batches or nothing.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<String, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in a table (for test assertions).
    pub async fn len(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, Table::len)
    }
}

#[async_trait]
impl Substrate for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn get_many(&self, table: &str, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let tables = self.tables.read().await;
        let table = tables.get(table);
        Ok(keys
            .iter()
            .map(|key| table.and_then(|t| t.get(key)).cloned())
            .collect())
    }

    async fn scan(&self, table: &str, range: &ScanRange) -> Result<Vec<(String, Value)>> {
        let tables = self.tables.read().await;
        let Some(table) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let start = match &range.after {
            Some(after) if after.as_str() >= range.prefix.as_str() => after.clone(),
            _ => range.prefix.clone(),
        };
        let entries = table
            .range(start..)
            .take_while(|(key, _)| key.starts_with(&range.prefix))
            .filter(|(key, _)| range.admits(key))
            .take(range.limit.unwrap_or(usize::MAX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(entries)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), CommitError> {
        let mut tables = self.tables.write().await;

        for guard in batch.guards() {
            let current = tables.get(&guard.table).and_then(|t| t.get(&guard.key));
            if !guard.holds(current) {
                return Err(CommitError::GuardFailed {
                    table: guard.table.clone(),
                    key: guard.key.clone(),
                });
            }
        }

        for op in batch.ops() {
            match op {
                WriteOp::Put { table, key, value } => {
                    tables
                        .entry(table.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                WriteOp::Delete { table, key } => {
                    if let Some(t) = tables.get_mut(table) {
                        t.remove(key);
                    }
                }
            }
        }

        debug!(
            guards = batch.guards().len(),
            ops = batch.ops().len(),
            "Committed batch to memory store"
        );
        Ok(())
    }
}
