//! Transactional entity store over an ordered key-value substrate.
//!
//! Events are the source of truth. Entity records cache their fold, derived
//! rows cache query views of entities, and the backend commits all three in
//! one substrate batch so readers only ever see consistent state.
//!
//! The substrate is pluggable: `MemoryStore` for tests and embedded use,
//! `PgStore` for Postgres.

pub mod backend;
pub mod locks;
pub mod memory;
pub mod postgres;
pub mod substrate;
pub mod types;

pub use backend::DatabaseBackend;
pub use locks::{EntityLocks, LockSet};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use substrate::{CommitError, Guard, ScanRange, Substrate, WriteBatch, WriteOp};
pub use types::{EntityMap, EntityQuery, EntityRecord, Modification};
