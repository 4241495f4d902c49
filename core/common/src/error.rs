//! Common error types for ShowSync.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::VersionedEntity;

/// Top-level error type for ShowSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote store could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote call exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Remote store reported itself temporarily unavailable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Remote store is throttling this client.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided (validation rejected).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Compare-and-set rejected: the remote copy is at another version.
    #[error("Version conflict on {entity_id}: expected {expected}, remote at {}", current.version)]
    VersionConflict {
        entity_id: String,
        expected: u64,
        current: Box<VersionedEntity>,
    },

    /// An internal invariant was violated.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Mutation queue operation rejected in the record's current state.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Sync scheduler is not running or dropped a request.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

/// Coarse error classes used to route failures through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Retried automatically with backoff.
    Transient,
    /// Routed to the conflict resolver.
    Conflict,
    /// Surfaced without retry.
    Permanent,
}

impl Error {
    /// Whether the error represents a transient condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Timeout(_)
                | Error::Unavailable(_)
                | Error::RateLimited(_)
                | Error::Io(_)
        )
    }

    /// Classify the error for routing.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::VersionConflict { .. } => ErrorClass::Conflict,
            e if e.is_transient() => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    /// Remote snapshot carried by a version conflict.
    pub fn conflict_snapshot(&self) -> Option<&VersionedEntity> {
        match self {
            Error::VersionConflict { current, .. } => Some(current),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, EntityKind};

    #[test]
    fn test_transient_classification() {
        assert_eq!(Error::Network("down".into()).class(), ErrorClass::Transient);
        assert_eq!(Error::Timeout("10s".into()).class(), ErrorClass::Transient);
        assert_eq!(Error::RateLimited("429".into()).class(), ErrorClass::Transient);
        assert_eq!(Error::Unavailable("503".into()).class(), ErrorClass::Transient);
    }

    #[test]
    fn test_permanent_classification() {
        assert_eq!(Error::NotFound("x".into()).class(), ErrorClass::Permanent);
        assert_eq!(Error::NotPermitted("x".into()).class(), ErrorClass::Permanent);
        assert_eq!(Error::InvalidInput("x".into()).class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_conflict_carries_snapshot() {
        let remote = VersionedEntity::new(EntityId::new("show-1").unwrap(), EntityKind::Show);
        let err = Error::VersionConflict {
            entity_id: "show-1".into(),
            expected: 2,
            current: Box::new(remote),
        };
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(!err.is_transient());
        assert_eq!(err.conflict_snapshot().map(|e| e.version), Some(0));
    }
}
