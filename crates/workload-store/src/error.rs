//! Store errors

use thiserror::Error;

/// Errors that can occur when talking to the orchestration store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write rejected because the object changed since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Store unreachable or overloaded; safe to retry
    #[error("Store unavailable: {0}")]
    Transient(String),

    /// Store rejected the request
    #[error("Store API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same operation after a fresh read may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Transient(_))
    }

    /// Whether the error is a concurrent modification
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(response) => match response.code {
                404 => StoreError::NotFound(response.message.clone()),
                409 => StoreError::Conflict(response.message.clone()),
                429 | 500..=599 => StoreError::Transient(error.to_string()),
                _ => StoreError::Api(error.to_string()),
            },
            kube::Error::SerdeError(e) => StoreError::Api(format!("invalid response body: {e}")),
            // Everything else is transport level (connect, TLS, timeouts)
            _ => StoreError::Transient(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Conflict("rv changed".to_string()).is_retryable());
        assert!(StoreError::Transient("connection reset".to_string()).is_retryable());
        assert!(!StoreError::NotFound("gone".to_string()).is_retryable());
        assert!(!StoreError::Api("forbidden".to_string()).is_retryable());
    }
}
