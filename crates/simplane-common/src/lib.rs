//! Common types for simplane: tenants, jobs, errors, settings and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod credential;
pub mod error;
pub mod job;
pub mod metrics;
pub mod telemetry;
pub mod tenant;

pub use error::Error;
pub use job::{Job, JobStatus, ResultLocation, StatusUpdate, StorageKind};
pub use tenant::{LimitsPatch, Tenant, TenantLimits};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key identifying resources managed by simplane
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "simplane";

/// Label key carrying the owning tenant id
pub const TENANT_LABEL: &str = "simplane.io/tenant";

/// Label key carrying the owning job id
pub const JOB_ID_LABEL: &str = "simplane.io/job-id";

/// Label marking an object for removal by the cleanup sweep
pub const CLEANUP_LABEL: &str = "simplane.io/cleanup";
