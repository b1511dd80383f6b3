//! Reconcile external sources of tasks against what the store already holds.
//!
//! The reconciler reads entities through the backend and returns the events
//! that would bring the store in line with the sources. It never writes;
//! callers pass the events to `DatabaseBackend::put_events`.

pub mod reconciler;
pub mod types;

pub use reconciler::Reconciler;
pub use types::{IngestibleItem, IngestibleSource};
