use orbit_world::{EntityId, InvalidOutcomeError};
use thiserror::Error;

pub type Result<T, E = OrbitError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum OrbitError {
    #[error("Invalid event sequence for entity {entity_id}: {reason}")]
    InvalidEventSequence { entity_id: EntityId, reason: String },

    #[error("Invalid entity id '{entity_id}': must be non-empty and contain no '/'")]
    InvalidEntityId { entity_id: EntityId },

    #[error(transparent)]
    InvalidOutcome(#[from] InvalidOutcomeError),

    #[error("Entity {entity_id} has no ingestion item identifier")]
    MissingItemIdentifier { entity_id: EntityId },

    #[error("Source {source_identifier} has more than one item with identifier {identifier}")]
    DuplicateItemIdentifier {
        source_identifier: String,
        identifier: String,
    },

    #[error("Concurrency conflict: entity {entity_id} changed outside its lock")]
    ConcurrencyConflict { entity_id: EntityId },

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
}

impl OrbitError {
    pub fn invalid_sequence(entity_id: &EntityId, reason: impl Into<String>) -> Self {
        OrbitError::InvalidEventSequence {
            entity_id: entity_id.clone(),
            reason: reason.into(),
        }
    }

    /// Validation errors are the caller's data at fault; retrying won't help.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OrbitError::InvalidEventSequence { .. }
                | OrbitError::InvalidEntityId { .. }
                | OrbitError::InvalidOutcome(_)
                | OrbitError::MissingItemIdentifier { .. }
                | OrbitError::DuplicateItemIdentifier { .. }
                | OrbitError::InvalidConfig(_)
        )
    }
}

impl From<anyhow::Error> for OrbitError {
    fn from(err: anyhow::Error) -> Self {
        OrbitError::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_world::RepetitionOutcome;

    fn outcome(raw: &str) -> Result<RepetitionOutcome> {
        Ok(raw.parse()?)
    }

    #[test]
    fn bad_outcome_is_a_validation_error() {
        let err = outcome("skipped").unwrap_err();
        assert!(matches!(err, OrbitError::InvalidOutcome(_)));
        assert!(err.is_validation());
        assert!(err.to_string().contains("skipped"));
    }

    #[test]
    fn unstorable_entity_id_is_a_validation_error() {
        let err = OrbitError::InvalidEntityId {
            entity_id: EntityId::from("a/x"),
        };
        assert!(err.is_validation());
        assert!(err.to_string().contains("'a/x'"));
    }

    #[test]
    fn storage_errors_keep_their_context() {
        let err: OrbitError = anyhow::anyhow!("connection reset").context("commit").into();
        assert!(!err.is_validation());
        assert_eq!(err.to_string(), "Storage error: commit: connection reset");
    }
}
