//! Store error types

use thiserror::Error;

/// Errors raised by a tenant or job store
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint was violated
    #[error("conflict: {0}")]
    Conflict(String),

    /// The referenced row does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of row ("tenant", "job")
        kind: &'static str,
        /// Key that was looked up
        id: String,
    },

    /// A status write would break forward-only ordering
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        /// Job being updated
        job_id: String,
        /// Status the caller expected
        from: String,
        /// Status the caller tried to write
        to: String,
    },

    /// A persisted row could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The database rejected or failed the operation
    #[error("database error [{context}]: {source}")]
    Database {
        /// Operation that failed
        context: &'static str,
        /// Underlying driver error
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    /// Wrap a driver error with the failing operation
    pub fn database(context: &'static str, source: sqlx::Error) -> Self {
        Self::Database { context, source }
    }
}

impl From<StoreError> for simplane_common::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => simplane_common::Error::conflict(msg),
            StoreError::NotFound { kind, id } => simplane_common::Error::not_found(kind, id),
            StoreError::InvalidTransition { .. } => {
                simplane_common::Error::conflict(err.to_string())
            }
            StoreError::Corrupt(_) => simplane_common::Error::storage("decode", err.to_string()),
            StoreError::Database { context, ref source } => {
                simplane_common::Error::storage(context, source.to_string())
            }
        }
    }
}
