//! Error types for the fact store.

use crate::script::ScriptError;
use crate::transformation::TransformationKey;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for store operations.
///
/// Stale or unknown state tokens are not errors: conditional publishing
/// reports them as `Ok(false)`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Log is locked by another process")]
    Locked,

    #[error("Log not initialized")]
    NotInitialized,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Fact already published: {0}")]
    DuplicateFactId(Uuid),

    #[error("Fact {id} failed validation: {reason}")]
    InvalidFact { id: Uuid, reason: String },

    #[error("No transformation chain found for {key} from version {from} to {to}")]
    NoTransformationChainFound {
        key: TransformationKey,
        from: u32,
        to: u32,
    },

    #[error("Transformation of fact {id} failed: {reason}")]
    TransformationFailed { id: Uuid, reason: String },

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Registry fetch failed: {0}")]
    RegistryFetch(String),

    #[error("Invalid registry index: {0}")]
    RegistryIndex(String),

    #[error("Subscription dropped: live buffer overflowed")]
    SubscriptionDropped,

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Optimistic lock not acquired after {0} attempts")]
    OptimisticRetriesExceeded(u32),
}

impl StoreError {
    /// True for failures to find or apply a transformation for one fact.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            StoreError::NoTransformationChainFound { .. } | StoreError::TransformationFailed { .. }
        )
    }

    /// True if repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_)
                | StoreError::Locked
                | StoreError::RegistryFetch(_)
                | StoreError::SubscriptionDropped
                | StoreError::OptimisticRetriesExceeded(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = StoreError::NoTransformationChainFound {
            key: TransformationKey::new("ns", "type"),
            from: 1,
            to: 3,
        };
        assert!(err.is_resolution_error());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "No transformation chain found for ns/type from version 1 to 3"
        );

        assert!(StoreError::SubscriptionDropped.is_retryable());
        assert!(!StoreError::InvalidArgument("x".into()).is_retryable());
    }
}
