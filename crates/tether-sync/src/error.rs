//! # Sync Error Types
//!
//! The structured error every ticket and direct call resolves with.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │     Store       │  │    Network      │  │     Mapping             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Store(DbError) │  │  Network        │  │  Decode                 │ │
//! │  │  DedupViolation │  │  InvalidUrl     │  │  Mapping                │ │
//! │  │                 │  │                 │  │  PartialBatch           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Programmer    │  │     Queue       │  │  Configuration          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  wait() inside  │  │  Cancelled      │  │  InvalidConfig          │ │
//! │  │  the queue,     │  │  QueueStopped   │  │  ConfigLoadFailed       │ │
//! │  │  missing key    │  │  ChannelError   │  │  ConfigSaveFailed       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use tether_core::CoreError;
use tether_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Error delivered to a work item's ticket or returned by a direct call.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Store adapter failure (query, write, commit, rollback).
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    /// A record was inserted with a primary key that is already stored.
    ///
    /// ## When This Occurs
    /// - `save` (insert-only) of a record whose key exists; use `save_or_update` to merge
    #[error("{entity} with primary key {key} already exists")]
    DedupViolation { entity: String, key: String },

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// Transport failure or non-success HTTP status.
    #[error("Request to {url} failed{}: {reason}", .status.map(|s| format!(" with status {}", s)).unwrap_or_default())]
    Network {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// Request URL could not be built.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    // =========================================================================
    // Mapping Errors
    // =========================================================================
    /// Response body could not be decoded into a parse tree.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Parse tree did not have the shape the entity expects.
    #[error("Cannot map {entity}{}: {reason}", .index.map(|i| format!(" element {}", i)).unwrap_or_default())]
    Mapping {
        entity: String,
        index: Option<usize>,
        reason: String,
    },

    /// Some elements of a collection fetch failed to map; the rest were kept.
    #[error("{failed} of {total} {entity} elements failed to map")]
    PartialBatch {
        entity: String,
        failed: usize,
        total: usize,
    },

    // =========================================================================
    // Programmer Errors
    // =========================================================================
    /// Misuse of the API that retrying cannot fix.
    ///
    /// ## When This Occurs
    /// - `wait()` called from inside the queue's own execution context
    /// - Record without a primary key for an entity that requires one
    /// - Record of one entity passed to another entity's model
    #[error("Programmer error: {0}")]
    Programmer(String),

    // =========================================================================
    // Queue Errors
    // =========================================================================
    /// Item was discarded by `stop_operations()` before it started.
    #[error("Operation cancelled before it started")]
    Cancelled,

    /// Item was submitted after `stop_operations()`.
    #[error("Work queue is stopped")]
    QueueStopped,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match err {
            CoreError::Mapping { entity, reason } => SyncError::Mapping {
                entity,
                index: None,
                reason,
            },
            CoreError::NotAnObject { entity, .. } => SyncError::Mapping {
                entity,
                index: None,
                reason: message,
            },
            CoreError::MissingPrimaryKey { .. } => SyncError::Programmer(message),
            _ => SyncError::Internal(message),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Creates a Network error without an HTTP status.
    pub fn network(url: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Network {
            url: url.into(),
            status: None,
            reason: reason.into(),
        }
    }

    /// Creates a Mapping error for one element of a collection.
    pub fn mapping_at(entity: impl Into<String>, index: usize, reason: impl Into<String>) -> Self {
        SyncError::Mapping {
            entity: entity.into(),
            index: Some(index),
            reason: reason.into(),
        }
    }

    /// Returns true if the caller may retry the same operation.
    ///
    /// ## Retryable Errors
    /// - Network failures without a status, and 5xx / 429 responses
    /// - Pool exhaustion or connection loss in the store
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { status: None, .. } => true,
            SyncError::Network {
                status: Some(code), ..
            } => *code >= 500 || *code == 429,
            SyncError::Store(DbError::PoolExhausted | DbError::ConnectionFailed(_)) => true,
            _ => false,
        }
    }

    /// Returns true if this error reports API misuse.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, SyncError::Programmer(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::network("http://x", "connection reset").is_retryable());
        assert!(SyncError::Network {
            url: "http://x".into(),
            status: Some(503),
            reason: "unavailable".into()
        }
        .is_retryable());
        assert!(SyncError::Store(DbError::PoolExhausted).is_retryable());

        assert!(!SyncError::Network {
            url: "http://x".into(),
            status: Some(404),
            reason: "not found".into()
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Programmer("wait".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::Network {
            url: "http://api/articles".into(),
            status: Some(404),
            reason: "Not Found".into(),
        };
        assert_eq!(
            err.to_string(),
            "Request to http://api/articles failed with status 404: Not Found"
        );

        let err = SyncError::mapping_at("Article", 1, "expected object, got number");
        assert_eq!(
            err.to_string(),
            "Cannot map Article element 1: expected object, got number"
        );
    }

    #[test]
    fn test_core_error_conversion() {
        let err: SyncError = CoreError::MissingPrimaryKey {
            entity: "Tag".into(),
            field: "objID".into(),
        }
        .into();
        assert!(err.is_programmer_error());

        let err: SyncError = CoreError::mapping("Article", "bad").into();
        assert!(matches!(err, SyncError::Mapping { index: None, .. }));
    }
}
