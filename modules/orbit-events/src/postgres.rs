//! PgStore: substrate backed by a single Postgres key-value table.
//!
//! Every logical table is a `tbl` partition of `kv`. Keys are compared with
//! the "C" collation so scans follow byte order, same as `MemoryStore`.
//! Commits run in a SERIALIZABLE transaction; guards lock their rows with
//! `FOR UPDATE` before any op is applied, and a dropped transaction rolls back.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::substrate::{CommitError, Guard, ScanRange, Substrate, WriteBatch, WriteOp};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Create the backing table if it doesn't exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                tbl    TEXT   NOT NULL,
                key    TEXT   NOT NULL,
                value  JSONB  NOT NULL,
                PRIMARY KEY (tbl, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns the first guard that failed, if any. The transaction is only
    /// committed when every guard holds.
    async fn try_commit(&self, batch: &WriteBatch) -> Result<Option<Guard>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        for guard in batch.guards() {
            let current = sqlx::query_as::<_, (Value,)>(
                "SELECT value FROM kv WHERE tbl = $1 AND key = $2 FOR UPDATE",
            )
            .bind(&guard.table)
            .bind(&guard.key)
            .fetch_optional(&mut *tx)
            .await?;

            if !guard.holds(current.as_ref().map(|row| &row.0)) {
                // Dropping `tx` rolls back.
                return Ok(Some(guard.clone()));
            }
        }

        for op in batch.ops() {
            match op {
                WriteOp::Put { table, key, value } => {
                    sqlx::query(
                        r#"
                        INSERT INTO kv (tbl, key, value) VALUES ($1, $2, $3)
                        ON CONFLICT (tbl, key) DO UPDATE SET value = EXCLUDED.value
                        "#,
                    )
                    .bind(table)
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::Delete { table, key } => {
                    sqlx::query("DELETE FROM kv WHERE tbl = $1 AND key = $2")
                        .bind(table)
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(None)
    }
}

#[async_trait]
impl Substrate for PgStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query_as::<_, (Value,)>("SELECT value FROM kv WHERE tbl = $1 AND key = $2")
            .bind(table)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn get_many(&self, table: &str, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let rows = sqlx::query_as::<_, (String, Value)>(
            "SELECT key, value FROM kv WHERE tbl = $1 AND key = ANY($2)",
        )
        .bind(table)
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;

        // Keys may repeat; every copy gets the value.
        let found: std::collections::HashMap<String, Value> = rows.into_iter().collect();
        Ok(keys.iter().map(|key| found.get(key).cloned()).collect())
    }

    async fn scan(&self, table: &str, range: &ScanRange) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query_as::<_, (String, Value)>(
            r#"
            SELECT key, value
            FROM kv
            WHERE tbl = $1
              AND starts_with(key, $2)
              AND ($3::TEXT IS NULL OR key COLLATE "C" > $3::TEXT COLLATE "C")
            ORDER BY key COLLATE "C" ASC
            LIMIT $4
            "#,
        )
        .bind(table)
        .bind(&range.prefix)
        .bind(&range.after)
        .bind(range.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), CommitError> {
        match self.try_commit(&batch).await? {
            None => {
                debug!(
                    guards = batch.guards().len(),
                    ops = batch.ops().len(),
                    "Committed batch to postgres"
                );
                Ok(())
            }
            Some(guard) => {
                warn!(
                    table = guard.table.as_str(),
                    key = guard.key.as_str(),
                    "Commit guard failed"
                );
                Err(CommitError::GuardFailed {
                    table: guard.table,
                    key: guard.key,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test utilities
// ---------------------------------------------------------------------------

#[cfg(feature = "test-utils")]
impl PgStore {
    /// Empty every table (for tests).
    pub async fn truncate(&self) -> Result<()> {
        sqlx::query("TRUNCATE kv").execute(&self.pool).await?;
        Ok(())
    }
}
