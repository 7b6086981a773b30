//! # Error Types
//!
//! Domain-specific error types for tether-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tether-core errors (this file)                                        │
//! │  └── CoreError        - Mapping and record-shape failures              │
//! │                                                                         │
//! │  tether-db errors (separate crate)                                     │
//! │  └── DbError          - Store adapter failures                         │
//! │                                                                         │
//! │  tether-sync errors (separate crate)                                   │
//! │  └── SyncError        - What queue callers and tickets see             │
//! │                                                                         │
//! │  Flow: CoreError → DbError / SyncError → caller                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Record model errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A parse-tree node or typed value did not have the shape the entity expects.
    ///
    /// ## When This Occurs
    /// - A collection element is a number instead of an object
    /// - A stored record no longer deserializes into its Rust type
    #[error("Cannot map {entity}: {reason}")]
    Mapping { entity: String, reason: String },

    /// An entity that requires a primary key was given a record without one.
    #[error("{entity} requires a value for primary key field '{field}'")]
    MissingPrimaryKey { entity: String, field: String },

    /// A value serialized to something other than a JSON object.
    #[error("{entity} must serialize to an object, got {found}")]
    NotAnObject { entity: String, found: String },

    /// A field name cannot be used in a query or mapping.
    #[error("Invalid field name '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// serde_json failure while converting between typed values and field maps.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Creates a Mapping error.
    pub fn mapping(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Mapping {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::MissingPrimaryKey {
            entity: "Article".to_string(),
            field: "objID".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Article requires a value for primary key field 'objID'"
        );

        let err = CoreError::mapping("Article", "expected object, got number");
        assert_eq!(
            err.to_string(),
            "Cannot map Article: expected object, got number"
        );
    }

    #[test]
    fn test_serde_error_converts() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CoreError = serde_err.into();
        assert!(matches!(err, CoreError::Serialization(_)));
    }
}
