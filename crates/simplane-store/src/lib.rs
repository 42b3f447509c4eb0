//! Durable store for simplane tenants and jobs
//!
//! The store is the source of truth for job history. Admission is a single
//! store transaction: count the tenant's PENDING and RUNNING jobs, compare
//! against its concurrent-job limit, insert. [`PostgresStore`] serializes this
//! per tenant with a row lock on the tenant; [`MemoryStore`] does the same under
//! one mutex.

#![deny(missing_docs)]

mod error;
mod memory;
mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use simplane_common::{Job, JobStatus, ResultLocation, StatusUpdate, Tenant, TenantLimits};
use uuid::Uuid;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of the transactional admission check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The job row was inserted
    Admitted,
    /// The tenant was at its ceiling; nothing was written
    Rejected {
        /// PENDING and RUNNING jobs at the time of the check
        active: u32,
        /// The tenant's concurrent-job limit
        limit: u32,
    },
}

/// Sort order for job listings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JobOrder {
    /// Oldest submission first (reconciler batches)
    #[default]
    OldestFirst,
    /// Newest submission first (dashboards)
    NewestFirst,
}

/// Selection for [`JobStore::list_jobs`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobFilter {
    /// Statuses to include; empty means all
    pub statuses: Vec<JobStatus>,
    /// Restrict to one tenant
    pub tenant_id: Option<String>,
    /// Only jobs without a result location
    pub unresolved_only: bool,
    /// Sort order by submission time
    pub order: JobOrder,
    /// Maximum rows returned
    pub limit: u32,
}

impl JobFilter {
    /// Jobs in the given statuses, oldest first
    pub fn with_statuses(statuses: &[JobStatus], limit: u32) -> Self {
        Self {
            statuses: statuses.to_vec(),
            tenant_id: None,
            unresolved_only: false,
            order: JobOrder::OldestFirst,
            limit,
        }
    }

    /// In-flight jobs (PENDING, RUNNING), oldest first
    pub fn in_flight(limit: u32) -> Self {
        Self::with_statuses(&JobStatus::ACTIVE, limit)
    }

    /// Terminal jobs with no result location, oldest first
    pub fn unresolved(limit: u32) -> Self {
        Self {
            unresolved_only: true,
            ..Self::with_statuses(&JobStatus::TERMINAL, limit)
        }
    }

    /// Restrict to a tenant
    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sort newest first
    pub fn newest_first(mut self) -> Self {
        self.order = JobOrder::NewestFirst;
        self
    }

    fn effective_statuses(&self) -> Vec<JobStatus> {
        if self.statuses.is_empty() {
            vec![
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Succeeded,
                JobStatus::Failed,
            ]
        } else {
            self.statuses.clone()
        }
    }

    fn matches(&self, job: &Job) -> bool {
        self.effective_statuses().contains(&job.status)
            && self
                .tenant_id
                .as_ref()
                .map_or(true, |t| t == &job.tenant_id)
            && (!self.unresolved_only || job.result.is_none())
    }
}

/// Persistence for tenant identity and limits
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Insert a new tenant; `Conflict` if the id, scope name or credential is taken
    async fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()>;

    /// Look up a tenant by id
    async fn get_tenant(&self, tenant_id: &str) -> StoreResult<Option<Tenant>>;

    /// Look up a tenant by credential digest
    async fn find_tenant_by_credential(&self, credential_hash: &str) -> StoreResult<Option<Tenant>>;

    /// Replace a tenant's limits, returning the updated tenant
    async fn update_limits(&self, tenant_id: &str, limits: &TenantLimits) -> StoreResult<Tenant>;

    /// Atomically replace a tenant's credential digest
    async fn rotate_credential(&self, tenant_id: &str, credential_hash: &str) -> StoreResult<()>;

    /// All tenants, newest first
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>>;
}

/// Persistence for job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Count the tenant's active jobs and insert `job` if under its limit, atomically
    ///
    /// The limit is read from the tenant row inside the same transaction.
    async fn admit_job(&self, job: &Job) -> StoreResult<Admission>;

    /// Look up a job by id
    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>>;

    /// Compare-and-set status write
    ///
    /// Returns `false` if the stored status no longer equals `update.expected`.
    /// Timestamps and the first-seen marker are kept if already set.
    async fn update_job_status(&self, job_id: Uuid, update: &StatusUpdate) -> StoreResult<bool>;

    /// Record the result location once
    ///
    /// Returns `false` if the job already has one or is not terminal.
    async fn set_result_location(
        &self,
        job_id: Uuid,
        location: &ResultLocation,
    ) -> StoreResult<bool>;

    /// List jobs matching `filter`
    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    /// Per-status job counts, optionally for one tenant
    async fn count_by_status(&self, tenant_id: Option<&str>)
        -> StoreResult<BTreeMap<JobStatus, u64>>;

    /// Check connectivity
    async fn ping(&self) -> StoreResult<()>;
}

/// A store holding both tenants and jobs
pub trait Store: TenantStore + JobStore {}

impl<T: TenantStore + JobStore> Store for T {}

/// Reject a status write that would move backwards or out of a terminal status
///
/// Writing the same status is allowed so timestamps and the first-seen marker
/// can be filled in without a transition.
pub(crate) fn check_transition(job_id: Uuid, update: &StatusUpdate) -> StoreResult<()> {
    if update.expected == update.status || update.expected.can_transition_to(update.status) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            job_id: job_id.to_string(),
            from: update.expected.to_string(),
            to: update.status.to_string(),
        })
    }
}
