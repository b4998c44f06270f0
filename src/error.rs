//! Error taxonomy for the engine.

use thiserror::Error;

use crate::store::StoreError;

/// Malformed caller input, naming the offending field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    /// Create a validation error for `field`.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error returned by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Input failed validation. Never retried.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The entity does not exist within the given project.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The underlying store or a collaborator was unavailable.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// A state change was requested on an execution that can no longer change.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl EngineError {
    /// Shorthand for a [`ValidationError`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::new(field, message))
    }

    /// Returns true if this is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Duplicate(msg) => Self::Conflict(msg),
            StoreError::Storage(msg) | StoreError::Serialization(msg) => Self::Infrastructure(msg),
        }
    }
}

/// Result alias used by engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let err: EngineError = StoreError::not_found("execution", "abc").into();
        assert!(err.is_not_found());

        let err: EngineError = StoreError::Storage("disk full".into()).into();
        assert!(matches!(err, EngineError::Infrastructure(ref m) if m == "disk full"));

        let err: EngineError = StoreError::Duplicate("schema exists".into()).into();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn test_validation_error_names_field() {
        let err = EngineError::validation("value", "must be finite");
        assert_eq!(err.to_string(), "invalid value: must be finite");
    }
}
