//! Controller-specific error types.
//!
//! Store failures keep their classification so the error policy can decide
//! between a jittered conflict retry, exponential backoff, or giving up
//! until the resource changes.

use crate::reconciler::normalize::ValidationError;
use kube::Error as KubeError;
use thiserror::Error;
use workload_store::StoreError;

/// Errors that can occur in the GPU plugin controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client error (client construction, watches)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Orchestration store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Spec violates an invariant
    #[error("Invalid spec: {0}")]
    Validation(#[from] ValidationError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource is missing identity or carries unreadable metadata
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Metrics/probe server I/O error
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}

impl ControllerError {
    /// Store unreachable or overloaded; counts towards the degraded ceiling.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Store(e) => e.is_retryable() && !e.is_conflict(),
            ControllerError::Kube(_) => true,
            _ => false,
        }
    }

    /// Concurrent modification; retried after a fresh read.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Store(e) if e.is_conflict())
    }
}
