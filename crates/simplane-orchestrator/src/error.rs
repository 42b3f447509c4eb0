//! Orchestrator error types

use std::time::Duration;

use thiserror::Error;

/// Errors returned by an [`crate::Orchestrator`]
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The Kubernetes API rejected or failed the request
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A required object does not exist
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Object kind ("pod", "job")
        kind: &'static str,
        /// Object name
        name: String,
    },

    /// A manifest could not be built from the request
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The call did not complete within its bound
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Bound that was exceeded
        after: Duration,
    },

    /// The orchestrator could not be reached
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
}

impl OrchestratorError {
    /// Create a not-found error
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether the target object is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Whether the orchestrator itself could not be reached
    ///
    /// Distinguishes a cluster-wide outage from a failure scoped to one object.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_)
                | Self::Kube(kube::Error::HyperError(_))
                | Self::Kube(kube::Error::Service(_))
        )
    }

    /// Whether the target object already exists
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// Check if the call may succeed if retried
    ///
    /// API rejections (4xx other than conflict and throttling) and bad
    /// manifests are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(ae)) => {
                ae.code >= 500 || ae.code == 409 || ae.code == 429
            }
            Self::Kube(_) => true,
            Self::NotFound { .. } => false,
            Self::InvalidManifest(_) => false,
            Self::Timeout { .. } => true,
            Self::Unavailable(_) => true,
        }
    }

    /// Convert into the shared taxonomy, naming the failed operation
    pub fn into_error(self, context: &str) -> simplane_common::Error {
        if self.is_retryable() {
            simplane_common::Error::orchestrator(context, self.to_string())
        } else {
            simplane_common::Error::orchestrator_permanent(context, self.to_string())
        }
    }
}
