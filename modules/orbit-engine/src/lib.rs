//! Pure event-sourcing machinery for the Orbit store.
//!
//! Fold events into entities (`reducer`), advance review schedules
//! (`scheduler`), and turn entity transitions into derived-row deltas
//! (`projector`). Nothing here touches storage or the clock; replaying the
//! same events always yields the same state.

pub mod projector;
pub mod reducer;
pub mod scheduler;

pub use projector::{project, rows_for, DerivedDelta, DerivedRowKey, DueComponentRow};
pub use reducer::{sort_events, EntityReducer};
pub use scheduler::Scheduler;
