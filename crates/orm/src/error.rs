//! Error types for relation resolution
//!
//! Storage failures pass through unchanged, integrity problems detected by
//! this layer are translated into the taxonomy below, and configuration
//! mistakes surface synchronously from declaration or binding calls.

use std::fmt;

use crate::validation::ValidationErrors;

/// Result type alias for relation operations
pub type RelationResult<T> = Result<T, RelationError>;

/// Error types for relation operations
#[derive(Debug, Clone, PartialEq)]
pub enum RelationError {
    /// Referenced target record is absent
    NotFound { model: String, id: String },
    /// Retrieved record's key does not match the expected foreign/primary key.
    /// Indicates a storage-engine or data-integrity inconsistency, not user error.
    KeyMismatch {
        model: String,
        expected: String,
        actual: String,
    },
    /// No join row exists for a through-relation pair
    NoSuchAssociation { relation: String, id: String },
    /// A hasOne relation already has a target record
    DuplicateHasOne { relation: String },
    /// Field-level validation failures
    Validation(ValidationErrors),
    /// Polymorphic discriminator value is absent or names an unknown model
    UnresolvedPolymorphicType(String),
    /// A record or relation reference cannot be resolved (declaration mistake)
    InvalidReference(String),
    /// Invalid relation declaration or schema configuration
    Configuration(String),
    /// Storage-engine failure, passed through unchanged
    Store(String),
}

impl RelationError {
    /// HTTP-style classification of the error, carried for remote exposure.
    pub fn status_code(&self) -> u16 {
        match self {
            RelationError::NotFound { .. } => 404,
            RelationError::NoSuchAssociation { .. } => 404,
            RelationError::KeyMismatch { .. } => 400,
            RelationError::DuplicateHasOne { .. } => 409,
            RelationError::Validation(_) => 422,
            RelationError::UnresolvedPolymorphicType(_) => 400,
            RelationError::InvalidReference(_) => 400,
            RelationError::Configuration(_) => 500,
            RelationError::Store(_) => 500,
        }
    }

    /// True for errors caused by a declaration/programming mistake rather
    /// than a runtime data condition. These are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RelationError::UnresolvedPolymorphicType(_)
                | RelationError::InvalidReference(_)
                | RelationError::Configuration(_)
        )
    }
}

impl fmt::Display for RelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationError::NotFound { model, id } => {
                write!(f, "Record not found in model '{}' for id '{}'", model, id)
            }
            RelationError::KeyMismatch {
                model,
                expected,
                actual,
            } => write!(
                f,
                "Key mismatch on model '{}': expected '{}', got '{}'",
                model, expected, actual
            ),
            RelationError::NoSuchAssociation { relation, id } => {
                write!(f, "No association in relation '{}' for id '{}'", relation, id)
            }
            RelationError::DuplicateHasOne { relation } => {
                write!(f, "Relation '{}' already has a target record", relation)
            }
            RelationError::Validation(errors) => write!(f, "Validation error: {}", errors),
            RelationError::UnresolvedPolymorphicType(name) => {
                write!(f, "Unresolved polymorphic type '{}'", name)
            }
            RelationError::InvalidReference(msg) => write!(f, "Invalid reference: {}", msg),
            RelationError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            RelationError::Store(msg) => write!(f, "Store error: {}", msg),
        }
    }
}

impl std::error::Error for RelationError {}

impl From<ValidationErrors> for RelationError {
    fn from(errors: ValidationErrors) -> Self {
        RelationError::Validation(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let not_found = RelationError::NotFound {
            model: "Post".to_string(),
            id: "7".to_string(),
        };
        assert_eq!(not_found.status_code(), 404);

        let mismatch = RelationError::KeyMismatch {
            model: "Post".to_string(),
            expected: "1".to_string(),
            actual: "2".to_string(),
        };
        assert_eq!(mismatch.status_code(), 400);

        assert_eq!(
            RelationError::DuplicateHasOne {
                relation: "profile".to_string()
            }
            .status_code(),
            409
        );
    }

    #[test]
    fn test_configuration_classification() {
        assert!(RelationError::UnresolvedPolymorphicType("Widget".to_string()).is_configuration());
        assert!(RelationError::InvalidReference("bad".to_string()).is_configuration());
        assert!(!RelationError::Store("down".to_string()).is_configuration());
    }

    #[test]
    fn test_display_formats() {
        let err = RelationError::NoSuchAssociation {
            relation: "tags".to_string(),
            id: "3".to_string(),
        };
        assert_eq!(err.to_string(), "No association in relation 'tags' for id '3'");
    }
}
