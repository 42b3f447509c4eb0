//! Admission controller
//!
//! Submission order matters:
//! 1. resource bounds (global per-job ceiling, then tenant limits)
//! 2. payload validation
//! 3. scope apply (idempotent, refreshes the tenant's ceilings)
//! 4. quota-gated insert of the PENDING row, atomically in the store
//! 5. unit submission
//!
//! Nothing reaches the orchestrator before steps 1 and 2 pass, and nothing is
//! written to the store before step 3 succeeds. A failed step 5 leaves the row
//! FAILED rather than deleting it, so retries cannot slip past the quota.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use simplane_common::config::{AdmissionSettings, ReconcilerSettings};
use simplane_common::metrics::{self, AdmissionOutcome};
use simplane_common::{
    Error, Job, JobStatus, ResultLocation, Result, StatusUpdate, Tenant, TenantLimits,
};
use simplane_orchestrator::{Orchestrator, ScopeSpec, UnitSpec};
use simplane_store::{Admission, JobFilter, JobStore, Store};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bounded;
use crate::payload::validate_payload;

/// Number of recent jobs shown on the tenant dashboard
const DASHBOARD_RECENT_JOBS: u32 = 20;

/// Scenario metadata keys set by admission; caller metadata cannot override them
const SCENARIO_ID_KEY: &str = "scenario_id";
const CONFIG_FILE_KEY: &str = "config_file";

/// A job submission
#[derive(Clone, Debug, Default)]
pub struct SubmitRequest {
    /// Free-form scenario identifier
    pub scenario_id: String,
    /// CPU cores
    pub cpu_request: u32,
    /// Memory in GiB
    pub memory_gi: u32,
    /// Optional ZIP archive of simulation inputs
    pub payload: Option<Vec<u8>>,
    /// Extra caller-supplied scenario metadata
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Ownership-checked view of a job's results
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobResults {
    /// Job identifier
    pub job_id: Uuid,
    /// Current status
    pub status: JobStatus,
    /// Result location, present only for resolved SUCCEEDED jobs
    pub result: Option<ResultLocation>,
}

/// Tenant overview
#[derive(Clone, Debug, Serialize)]
pub struct Dashboard {
    /// Tenant identifier
    pub tenant_id: String,
    /// Execution scope
    pub namespace: String,
    /// Current limits
    pub limits: TenantLimits,
    /// Jobs in PENDING or RUNNING
    pub active_jobs: u64,
    /// Job counts by status
    pub counts: BTreeMap<JobStatus, u64>,
    /// Most recent jobs, newest first
    pub recent: Vec<Job>,
}

/// Validates submissions, gates them on the tenant's concurrency quota and
/// hands them to the orchestrator
pub struct AdmissionController {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    settings: AdmissionSettings,
    volume_size_gi: u32,
    output_lines: u32,
    call_timeout: Duration,
}

impl AdmissionController {
    /// Create an admission controller
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        settings: AdmissionSettings,
        volume_size_gi: u32,
        reconciler: &ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            orchestrator,
            settings,
            volume_size_gi,
            output_lines: reconciler.output_lines,
            call_timeout: reconciler.call_timeout,
        }
    }

    fn validate_resources(&self, tenant: &Tenant, request: &SubmitRequest) -> Result<()> {
        if request.scenario_id.trim().is_empty() {
            return Err(Error::validation_field(
                SCENARIO_ID_KEY,
                "scenario_id must not be empty",
            ));
        }
        check_bound(
            "cpu_request",
            request.cpu_request,
            self.settings.max_job_cpu,
            tenant.limits.max_cpu,
        )?;
        check_bound(
            "memory_gi",
            request.memory_gi,
            self.settings.max_job_memory_gi,
            tenant.limits.max_memory_gi,
        )
    }

    fn scope_spec(&self, tenant: &Tenant) -> ScopeSpec {
        ScopeSpec {
            name: tenant.namespace.clone(),
            tenant_id: tenant.tenant_id.clone(),
            cpu_limit: tenant.limits.max_cpu,
            memory_limit_gi: tenant.limits.max_memory_gi,
            pod_cap: tenant.limits.max_concurrent_jobs,
            volume_size_gi: self.volume_size_gi,
        }
    }

    fn unit_spec(
        &self,
        job: &Job,
        payload: Option<Vec<u8>>,
        config_file: Option<String>,
    ) -> UnitSpec {
        let scenario_id = job
            .scenario
            .get(SCENARIO_ID_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        UnitSpec {
            scope: job.namespace.clone(),
            name: job.unit_name.clone(),
            job_id: job.job_id,
            cpu_request: job.cpu_request,
            memory_gi: job.memory_gi,
            env: BTreeMap::from([("SCENARIO_ID".to_string(), scenario_id)]),
            payload,
            config_file,
            config_suffix: self.settings.required_suffix.clone(),
            scenarios_dir: self.settings.bundled_scenarios_dir.clone(),
            image: self.settings.image.clone(),
            deadline: self.settings.job_deadline,
            finished_ttl: self.settings.finished_ttl,
            node_selector: self.settings.node_selector.clone(),
        }
    }

    /// Apply the tenant's scope with its current limits as ceilings
    ///
    /// Safe to repeat; each call refreshes the quota and limit range.
    pub async fn provision_scope(&self, tenant: &Tenant) -> Result<()> {
        let scope = self.scope_spec(tenant);
        bounded(
            "ensure_scope",
            self.settings.submit_timeout,
            self.orchestrator.ensure_scope(&scope),
        )
        .await
        .map_err(|e| {
            error!(tenant = %tenant.tenant_id, namespace = %scope.name, error = %e, "failed to ensure tenant scope");
            e.into_error("ensure_scope")
        })
    }

    /// Submit a job for `tenant`
    ///
    /// Returns the PENDING job. Fails with `QuotaExceeded` when the tenant
    /// already has its maximum of in-flight jobs.
    pub async fn submit(&self, tenant: &Tenant, request: SubmitRequest) -> Result<Job> {
        if let Err(e) = self.validate_resources(tenant, &request) {
            metrics::record_admission(AdmissionOutcome::Rejected);
            return Err(e);
        }

        let summary = match request.payload.as_deref().map(|p| validate_payload(p, &self.settings)) {
            Some(Err(e)) => {
                metrics::record_admission(AdmissionOutcome::Rejected);
                return Err(e);
            }
            Some(Ok(summary)) => Some(summary),
            None => None,
        };

        let mut scenario = request.metadata;
        scenario.remove(CONFIG_FILE_KEY);
        scenario.insert(
            SCENARIO_ID_KEY.to_string(),
            serde_json::Value::String(request.scenario_id.trim().to_string()),
        );
        if let Some(summary) = &summary {
            scenario.insert(
                CONFIG_FILE_KEY.to_string(),
                serde_json::Value::String(summary.config_file.clone()),
            );
        }

        if let Err(e) = self.provision_scope(tenant).await {
            metrics::record_admission(AdmissionOutcome::OrchestratorFailed);
            return Err(e);
        }

        let job = Job::new(
            &tenant.tenant_id,
            &tenant.namespace,
            request.cpu_request,
            request.memory_gi,
            scenario,
            Utc::now(),
        );

        match self.store.admit_job(&job).await? {
            Admission::Admitted => {}
            Admission::Rejected { active, limit } => {
                info!(tenant = %tenant.tenant_id, active, limit, "submission rejected: concurrent job limit reached");
                metrics::record_admission(AdmissionOutcome::QuotaExceeded);
                return Err(Error::quota_exceeded(&tenant.tenant_id, active, limit));
            }
        }

        let config_file = summary.map(|s| s.config_file);
        let unit = self.unit_spec(&job, request.payload, config_file);
        match bounded(
            "submit_unit",
            self.settings.submit_timeout,
            self.orchestrator.submit_unit(&unit),
        )
        .await
        {
            Ok(handle) => {
                info!(
                    tenant = %tenant.tenant_id,
                    job_id = %job.job_id,
                    unit = %handle.name,
                    cpu = job.cpu_request,
                    memory_gi = job.memory_gi,
                    "job admitted"
                );
                metrics::record_admission(AdmissionOutcome::Admitted);
                Ok(job)
            }
            Err(e) => {
                error!(tenant = %tenant.tenant_id, job_id = %job.job_id, error = %e, "unit submission failed");
                metrics::record_admission(AdmissionOutcome::OrchestratorFailed);
                self.mark_submission_failed(&job, &e.to_string()).await;
                Err(e.into_error("submit_unit"))
            }
        }
    }

    async fn mark_submission_failed(&self, job: &Job, reason: &str) {
        let now = Utc::now();
        let update = StatusUpdate {
            expected: JobStatus::Pending,
            status: JobStatus::Failed,
            started_at: None,
            finished_at: Some(now),
            observed_at: None,
            message: Some(format!("submission to orchestrator failed: {reason}")),
        };
        match self.store.update_job_status(job.job_id, &update).await {
            Ok(true) => metrics::record_transition(JobStatus::Failed),
            Ok(false) => warn!(job_id = %job.job_id, "job changed before it could be marked failed"),
            // The row stays PENDING; the reconciler fails it once the
            // visibility grace expires.
            Err(e) => error!(job_id = %job.job_id, error = %e, "failed to mark job failed after submission error"),
        }
    }

    /// Load a job owned by `tenant`
    async fn owned_job(&self, tenant: &Tenant, job_id: Uuid) -> Result<Job> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("job", job_id.to_string()))?;
        if job.tenant_id != tenant.tenant_id {
            warn!(tenant = %tenant.tenant_id, job_id = %job_id, "cross-tenant job access refused");
            return Err(Error::forbidden("job belongs to another tenant"));
        }
        Ok(job)
    }

    /// Current state of a job, from the store
    pub async fn get_status(&self, tenant: &Tenant, job_id: Uuid) -> Result<Job> {
        self.owned_job(tenant, job_id).await
    }

    /// Recent output of a job's unit of work
    ///
    /// Fails with `NotFound` once the orchestrator has cleaned up the unit.
    pub async fn get_logs(&self, tenant: &Tenant, job_id: Uuid) -> Result<String> {
        let job = self.owned_job(tenant, job_id).await?;
        bounded(
            "read_recent_output",
            self.call_timeout,
            self.orchestrator
                .read_recent_output(&job.namespace, &job.unit_name, self.output_lines),
        )
        .await
        .map_err(|e| {
            if e.is_not_found() {
                Error::not_found("logs", job_id.to_string())
            } else {
                e.into_error("read_recent_output")
            }
        })
    }

    /// Result location of a job; only SUCCEEDED jobs expose one
    pub async fn get_results(&self, tenant: &Tenant, job_id: Uuid) -> Result<JobResults> {
        let job = self.owned_job(tenant, job_id).await?;
        let result = match job.status {
            JobStatus::Succeeded => job.result,
            _ => None,
        };
        Ok(JobResults {
            job_id,
            status: job.status,
            result,
        })
    }

    /// Limits, recent jobs and per-status counts for a tenant
    pub async fn dashboard(&self, tenant: &Tenant) -> Result<Dashboard> {
        let counts = self.store.count_by_status(Some(&tenant.tenant_id)).await?;
        let recent = self
            .store
            .list_jobs(
                &JobFilter::with_statuses(&[], DASHBOARD_RECENT_JOBS)
                    .for_tenant(&tenant.tenant_id)
                    .newest_first(),
            )
            .await?;
        let active_jobs = JobStatus::ACTIVE
            .iter()
            .filter_map(|s| counts.get(s))
            .sum();
        Ok(Dashboard {
            tenant_id: tenant.tenant_id.clone(),
            namespace: tenant.namespace.clone(),
            limits: tenant.limits,
            active_jobs,
            counts,
            recent,
        })
    }
}

fn check_bound(field: &str, value: u32, global: u32, tenant: u32) -> Result<()> {
    if value == 0 {
        return Err(Error::validation_field(field, format!("{field} must be positive")));
    }
    if value > global {
        return Err(Error::validation_field(
            field,
            format!("{field} ({value}) exceeds the per-job maximum of {global}"),
        ));
    }
    if value > tenant {
        return Err(Error::validation_field(
            field,
            format!("{field} ({value}) exceeds the tenant limit of {tenant}"),
        ));
    }
    Ok(())
}
