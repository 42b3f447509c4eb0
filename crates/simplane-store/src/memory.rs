//! In-memory store for local development and tests

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use simplane_common::{Job, JobStatus, ResultLocation, StatusUpdate, Tenant, TenantLimits};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    check_transition, Admission, JobFilter, JobOrder, JobStore, StoreError, StoreResult,
    TenantStore,
};

#[derive(Default)]
struct State {
    tenants: HashMap<String, Tenant>,
    jobs: HashMap<Uuid, Job>,
}

/// Store backed by process memory
///
/// All operations take one lock, so the admission count-and-insert is atomic.
/// Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.tenants.contains_key(&tenant.tenant_id) {
            return Err(StoreError::Conflict(format!(
                "tenant {} already exists",
                tenant.tenant_id
            )));
        }
        if state
            .tenants
            .values()
            .any(|t| t.namespace == tenant.namespace)
        {
            return Err(StoreError::Conflict(format!(
                "namespace {} is already assigned to another tenant",
                tenant.namespace
            )));
        }
        if state
            .tenants
            .values()
            .any(|t| t.credential_hash == tenant.credential_hash)
        {
            return Err(StoreError::Conflict("credential collision".to_string()));
        }
        state
            .tenants
            .insert(tenant.tenant_id.clone(), tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: &str) -> StoreResult<Option<Tenant>> {
        Ok(self.state.lock().await.tenants.get(tenant_id).cloned())
    }

    async fn find_tenant_by_credential(&self, credential_hash: &str) -> StoreResult<Option<Tenant>> {
        Ok(self
            .state
            .lock()
            .await
            .tenants
            .values()
            .find(|t| t.credential_hash == credential_hash)
            .cloned())
    }

    async fn update_limits(&self, tenant_id: &str, limits: &TenantLimits) -> StoreResult<Tenant> {
        let mut state = self.state.lock().await;
        let tenant = state
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "tenant",
                id: tenant_id.to_string(),
            })?;
        tenant.limits = *limits;
        Ok(tenant.clone())
    }

    async fn rotate_credential(&self, tenant_id: &str, credential_hash: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .tenants
            .values()
            .any(|t| t.credential_hash == credential_hash)
        {
            return Err(StoreError::Conflict("credential collision".to_string()));
        }
        let tenant = state
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "tenant",
                id: tenant_id.to_string(),
            })?;
        tenant.credential_hash = credential_hash.to_string();
        Ok(())
    }

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self.state.lock().await.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tenants)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn admit_job(&self, job: &Job) -> StoreResult<Admission> {
        let mut state = self.state.lock().await;
        let limit = state
            .tenants
            .get(&job.tenant_id)
            .map(|t| t.limits.max_concurrent_jobs)
            .ok_or_else(|| StoreError::NotFound {
                kind: "tenant",
                id: job.tenant_id.clone(),
            })?;

        let active = state
            .jobs
            .values()
            .filter(|j| j.tenant_id == job.tenant_id && !j.status.is_terminal())
            .count() as u32;

        if active >= limit {
            return Ok(Admission::Rejected { active, limit });
        }
        if state.jobs.contains_key(&job.job_id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.job_id)));
        }
        state.jobs.insert(job.job_id, job.clone());
        Ok(Admission::Admitted)
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn update_job_status(&self, job_id: Uuid, update: &StatusUpdate) -> StoreResult<bool> {
        check_transition(job_id, update)?;
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != update.expected {
            return Ok(false);
        }
        job.status = update.status;
        job.started_at = job.started_at.or(update.started_at);
        job.finished_at = job.finished_at.or(update.finished_at);
        job.observed_at = job.observed_at.or(update.observed_at);
        if update.message.is_some() {
            job.status_message = update.message.clone();
        }
        Ok(true)
    }

    async fn set_result_location(
        &self,
        job_id: Uuid,
        location: &ResultLocation,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.result.is_none() && job.status.is_terminal() => {
                job.result = Some(location.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        match filter.order {
            JobOrder::OldestFirst => jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at)),
            JobOrder::NewestFirst => jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at)),
        }
        jobs.truncate(filter.limit as usize);
        Ok(jobs)
    }

    async fn count_by_status(
        &self,
        tenant_id: Option<&str>,
    ) -> StoreResult<BTreeMap<JobStatus, u64>> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for job in state
            .jobs
            .values()
            .filter(|j| tenant_id.map_or(true, |t| t == j.tenant_id))
        {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
