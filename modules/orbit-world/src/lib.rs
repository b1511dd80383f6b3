//! The shared vocabulary of the Orbit store: events, entities, identifiers.
//!
//! Pure data. No I/O, no behaviour beyond ordering and classification helpers.

pub mod eventlike;
pub mod events;
pub mod ids;
pub mod types;

pub use eventlike::Eventlike;
pub use events::{Event, EventPayload, InvalidOutcomeError, RepetitionOutcome};
pub use ids::{EntityId, EventId};
pub use types::*;
