//! Error taxonomy for simplane
//!
//! Every failure that can reach a caller of the admission path is one of these
//! variants. Each carries enough structured context (tenant, job, field) for the
//! transport layer to pick a status code and for operators to debug from logs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for simplane operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range request, user-correctable
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g., "cpu_request")
        field: Option<String>,
    },

    /// Missing or unknown credential
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Description of why authentication failed
        message: String,
    },

    /// Credential is valid but does not own the resource
    #[error("forbidden: {message}")]
    Forbidden {
        /// Description of the ownership mismatch
        message: String,
    },

    /// Tenant is at its concurrent-job ceiling; retry later
    #[error("quota exceeded for tenant {tenant}: {active}/{limit} concurrent jobs")]
    QuotaExceeded {
        /// Tenant that hit the ceiling
        tenant: String,
        /// Jobs currently in PENDING or RUNNING
        active: u32,
        /// Tenant's concurrent-job limit
        limit: u32,
    },

    /// Unknown tenant or job
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of the missing resource ("tenant", "job")
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Identifier or scope name already taken
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflicting resource
        message: String,
    },

    /// Input archive is missing required contents or is too large
    #[error("payload error: {message}")]
    Payload {
        /// Name of the violated requirement
        message: String,
        /// Whether the payload exceeded the size limit
        too_large: bool,
    },

    /// External orchestrator rejected or could not service a call
    #[error("orchestrator error [{context}]: {message}")]
    Orchestrator {
        /// Description of what failed
        message: String,
        /// Operation that failed (e.g., "submit_unit", "ensure_scope")
        context: String,
        /// Whether the call may succeed if retried
        retryable: bool,
    },

    /// Durable store transaction failure
    #[error("storage error [{context}]: {message}")]
    Storage {
        /// Description of what failed
        message: String,
        /// Operation that failed (e.g., "admit_job")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: msg.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden {
            message: msg.into(),
        }
    }

    /// Create a quota-exceeded error
    pub fn quota_exceeded(tenant: impl Into<String>, active: u32, limit: u32) -> Self {
        Self::QuotaExceeded {
            tenant: tenant.into(),
            active,
            limit,
        }
    }

    /// Create a not-found error for a resource kind and id
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create a payload error naming the missing requirement
    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload {
            message: msg.into(),
            too_large: false,
        }
    }

    /// Create a payload error for an archive over the size limit
    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self::Payload {
            message: msg.into(),
            too_large: true,
        }
    }

    /// Create a retryable orchestrator error with context
    pub fn orchestrator(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Orchestrator {
            message: msg.into(),
            context: context.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable orchestrator error (e.g., rejected manifest)
    pub fn orchestrator_permanent(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Orchestrator {
            message: msg.into(),
            context: context.into(),
            retryable: false,
        }
    }

    /// Create a storage error with context
    pub fn storage(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Short machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::Unauthorized { .. } => "unauthorized",
            Error::Forbidden { .. } => "forbidden",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::Payload { .. } => "payload",
            Error::Orchestrator { .. } => "orchestrator",
            Error::Storage { .. } => "storage",
        }
    }

    /// Check if this error is retryable
    ///
    /// Quota rejections clear once a job reaches a terminal state. Storage
    /// failures are transient by nature. Everything the caller sent wrong is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation { .. } => false,
            Error::Unauthorized { .. } => false,
            Error::Forbidden { .. } => false,
            Error::QuotaExceeded { .. } => true,
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => false,
            Error::Payload { .. } => false,
            Error::Orchestrator { retryable, .. } => *retryable,
            Error::Storage { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Orchestrator { context, .. } => Some(context),
            Error::Storage { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a tenant over its concurrency ceiling gets a distinct, retryable error
    ///
    /// Clients back off on quota rejections instead of treating them as bad input.
    #[test]
    fn story_quota_rejection_is_distinct_from_validation() {
        let err = Error::quota_exceeded("acme", 2, 2);
        assert!(err.to_string().contains("acme"));
        assert!(err.to_string().contains("2/2"));
        assert_eq!(err.kind(), "quota_exceeded");
        assert!(err.is_retryable());

        let err = Error::validation_field("cpu_request", "must be between 1 and 32");
        assert_eq!(err.kind(), "validation");
        assert!(!err.is_retryable());
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("cpu_request")),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: payload errors name the missing requirement
    #[test]
    fn story_payload_errors_name_requirement() {
        let err = Error::payload("no .sumocfg file found in archive");
        assert!(err.to_string().contains(".sumocfg"));
        assert!(matches!(err, Error::Payload { too_large: false, .. }));

        let err = Error::payload_too_large("archive is 120.00MB (max: 100MB)");
        assert!(matches!(err, Error::Payload { too_large: true, .. }));
        assert!(!err.is_retryable());
    }

    /// Story: orchestrator and storage errors carry the failing operation
    #[test]
    fn story_external_errors_carry_context() {
        let err = Error::orchestrator("submit_unit", "connection refused");
        assert_eq!(err.context(), Some("submit_unit"));
        assert!(err.to_string().contains("[submit_unit]"));
        assert!(err.is_retryable());

        let err = Error::orchestrator_permanent("submit_unit", "admission webhook denied");
        assert!(!err.is_retryable());

        let err = Error::storage("admit_job", "serialization failure");
        assert_eq!(err.context(), Some("admit_job"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_found_formats_kind_and_id() {
        let err = Error::not_found("job", "1234");
        assert_eq!(err.to_string(), "job not found: 1234");
        assert!(err.context().is_none());
    }

    #[test]
    fn test_auth_errors_are_not_retryable() {
        assert!(!Error::unauthorized("invalid API key").is_retryable());
        assert!(!Error::forbidden("job belongs to another tenant").is_retryable());
        assert!(!Error::conflict("tenant acme already exists").is_retryable());
    }
}
