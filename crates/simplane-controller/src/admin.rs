//! Administrative views across tenants

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use simplane_common::{Job, JobStatus, Result};
use simplane_orchestrator::{NodeInfo, Orchestrator};
use simplane_store::{JobFilter, JobStore, Store, TenantStore};

use crate::bounded;

/// Largest page returned by [`AdminViews::list_jobs`]
pub const MAX_ADMIN_PAGE: u32 = 500;

/// Job activity across all tenants
#[derive(Clone, Debug, Serialize)]
pub struct Activity {
    /// Job counts by status
    pub counts: BTreeMap<JobStatus, u64>,
    /// Jobs in PENDING or RUNNING
    pub active: u64,
    /// All jobs ever admitted
    pub total: u64,
    /// Registered tenants
    pub tenants: usize,
}

/// Read-only views for operators
pub struct AdminViews {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    call_timeout: Duration,
}

impl AdminViews {
    /// Create the admin views
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            call_timeout,
        }
    }

    /// Nodes with capacity, allocatable resources and readiness
    pub async fn cluster_nodes(&self) -> Result<Vec<NodeInfo>> {
        bounded("list_nodes", self.call_timeout, self.orchestrator.list_nodes())
            .await
            .map_err(|e| e.into_error("list_nodes"))
    }

    /// Jobs across tenants, newest first, optionally filtered by status
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<Job>> {
        let statuses: Vec<JobStatus> = status.into_iter().collect();
        let filter =
            JobFilter::with_statuses(&statuses, limit.clamp(1, MAX_ADMIN_PAGE)).newest_first();
        Ok(self.store.list_jobs(&filter).await?)
    }

    /// Per-status job counts
    pub async fn activity(&self) -> Result<Activity> {
        let counts = self.store.count_by_status(None).await?;
        let tenants = self.store.list_tenants().await?.len();
        let active = JobStatus::ACTIVE
            .iter()
            .filter_map(|s| counts.get(s))
            .sum();
        let total = counts.values().sum();
        Ok(Activity {
            counts,
            active,
            total,
            tenants,
        })
    }
}
