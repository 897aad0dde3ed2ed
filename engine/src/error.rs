//! Error types for the Harbor engine.

use crate::{ChangeType, ModelName, RecordId, SchemaVersion};
use thiserror::Error;

/// All possible errors from the Harbor engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("model not registered: {0}")]
    ModelNotFound(ModelName),

    #[error("record not found: {model}/{id}")]
    RecordNotFound { model: ModelName, id: RecordId },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("model '{model}' is missing primary key field '{field}'")]
    MissingPrimaryKey { model: ModelName, field: String },

    // Schema errors
    #[error("model '{model}' references unknown parent '{parent}'")]
    UnknownParent { model: ModelName, parent: ModelName },

    #[error("model dependency cycle involving '{0}'")]
    SchemaCycle(ModelName),

    // Write errors
    #[error("conditional write rejected for {model}/{id}: predicate not satisfied")]
    ConditionNotMet { model: ModelName, id: RecordId },

    // Outbox errors
    #[error("a creation is already pending for {0}")]
    ConflictingCreation(RecordId),

    #[error("{0} is already scheduled for deletion")]
    AlreadyScheduledForDeletion(RecordId),

    #[error("cannot enqueue {incoming} after pending {existing}")]
    UnexpectedMutationSequence {
        existing: ChangeType,
        incoming: ChangeType,
    },

    // Conflict errors
    #[error("conflict resolution targets {actual}, expected {expected}")]
    ConflictKeyMismatch { expected: String, actual: String },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::ModelNotFound("Post".into());
        assert_eq!(err.to_string(), "model not registered: Post");

        let err = Error::UnexpectedMutationSequence {
            existing: ChangeType::Delete,
            incoming: ChangeType::Create,
        };
        assert_eq!(err.to_string(), "cannot enqueue CREATE after pending DELETE");

        let err = Error::TypeMismatch {
            field: "rating".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'rating': expected Int, got String"
        );
    }
}
