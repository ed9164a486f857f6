//! Error types for the observer engine.

use crate::types::{ObserverId, Status};
use thiserror::Error;

/// Main error type for observer and dispatch operations.
#[derive(Debug, Error)]
pub enum ObserveError {
    /// Definition-time misconfiguration. Fatal at registration; must never
    /// surface at request time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Caller supplied an invalid request (e.g. missing request id).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Selector did not resolve to an instance.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Permission check rejected the action.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No live subscription entry for this observer/instance pair.
    #[error("Not subscribed: observer {observer} instance {instance}")]
    NotSubscribed {
        observer: ObserverId,
        instance: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A broker primitive (join/leave/publish) failed.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Anything else raised during retrieval or serialization.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ObserveError {
    /// Symbolic result code carried on the error reply for this failure.
    pub fn status(&self) -> Status {
        match self {
            ObserveError::Validation(_) => Status::BAD_REQUEST,
            ObserveError::PermissionDenied(_) => Status::FORBIDDEN,
            ObserveError::NotFound(_) | ObserveError::NotSubscribed { .. } => Status::NOT_FOUND,
            ObserveError::Configuration(_)
            | ObserveError::Serialization(_)
            | ObserveError::Broker(_)
            | ObserveError::Unexpected(_) => Status::INTERNAL_ERROR,
        }
    }
}

impl From<serde_json::Error> for ObserveError {
    fn from(e: serde_json::Error) -> Self {
        ObserveError::Serialization(e.to_string())
    }
}

/// Result type for observer operations.
pub type Result<T> = std::result::Result<T, ObserveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ObserveError::Validation("x".into()).status(),
            Status::BAD_REQUEST
        );
        assert_eq!(
            ObserveError::PermissionDenied("x".into()).status(),
            Status::FORBIDDEN
        );
        assert_eq!(
            ObserveError::NotFound("x".into()).status(),
            Status::NOT_FOUND
        );
        assert_eq!(
            ObserveError::NotSubscribed {
                observer: ObserverId(1),
                instance: "a".into()
            }
            .status(),
            Status::NOT_FOUND
        );
        assert_eq!(
            ObserveError::Unexpected("x".into()).status(),
            Status::INTERNAL_ERROR
        );
    }
}
