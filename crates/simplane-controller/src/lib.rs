//! Control-plane services for simplane
//!
//! - [`TenantRegistry`]: registration, credential authentication, limits
//! - [`AdmissionController`]: validated, quota-gated job submission
//! - [`Reconciler`]: folds orchestrator state back into the job store
//! - [`ResultResolver`]: decides and records where job outputs live
//! - [`AdminViews`]: cross-tenant read-only views
//!
//! Every service talks to the outside world only through the
//! [`simplane_store::Store`] and [`simplane_orchestrator::Orchestrator`] traits.

#![deny(missing_docs)]

pub mod admin;
pub mod admission;
pub mod payload;
pub mod reconciler;
pub mod resolver;
pub mod tenants;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use simplane_common::config::{
    AdmissionSettings, ReconcilerSettings, StorageSettings, TenantSettings,
};
use simplane_orchestrator::{Orchestrator, OrchestratorError};
use simplane_store::{JobStore, Store};

pub use admin::{Activity, AdminViews};
pub use admission::{AdmissionController, Dashboard, JobResults, SubmitRequest};
pub use payload::{validate_payload, PayloadSummary};
pub use reconciler::{observe, CycleReport, Reconciler, SweepReport};
pub use resolver::{detect_backend, Resolution, ResultResolver};
pub use tenants::{Registration, TenantRegistry};

/// All settings consumed by the control-plane services
#[derive(Clone, Debug, Default)]
pub struct ControlPlaneSettings {
    /// Submission bounds
    pub admission: AdmissionSettings,
    /// Tenant defaults and ceilings
    pub tenants: TenantSettings,
    /// Reconciliation cadence
    pub reconciler: ReconcilerSettings,
    /// Result storage
    pub storage: StorageSettings,
    /// Static key guarding administrative operations
    pub admin_key: Option<String>,
}

/// The wired-up set of control-plane services
#[derive(Clone)]
pub struct ControlPlane {
    /// Tenant registry
    pub tenants: Arc<TenantRegistry>,
    /// Admission controller
    pub admission: Arc<AdmissionController>,
    /// Reconciler and cleanup sweep
    pub reconciler: Arc<Reconciler>,
    /// Result location resolver
    pub resolver: Arc<ResultResolver>,
    /// Administrative views
    pub admin: Arc<AdminViews>,
    store: Arc<dyn Store>,
}

impl ControlPlane {
    /// Build every service over one store and one orchestrator
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        settings: ControlPlaneSettings,
    ) -> Self {
        let tenants = Arc::new(TenantRegistry::new(
            store.clone(),
            settings.tenants.clone(),
            settings.admin_key.clone(),
        ));
        let resolver = Arc::new(ResultResolver::new(
            store.clone(),
            orchestrator.clone(),
            settings.storage.clone(),
            &settings.reconciler,
            settings.admission.finished_ttl,
        ));
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            orchestrator.clone(),
            settings.admission.clone(),
            settings.storage.volume_size_gi,
            &settings.reconciler,
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            orchestrator.clone(),
            resolver.clone(),
            settings.reconciler.clone(),
        ));
        let admin = Arc::new(AdminViews::new(
            store.clone(),
            orchestrator,
            settings.reconciler.call_timeout,
        ));
        Self {
            tenants,
            admission,
            reconciler,
            resolver,
            admin,
            store,
        }
    }

    /// Check that the job store answers
    pub async fn ready(&self) -> simplane_common::Result<()> {
        Ok(self.store.ping().await?)
    }
}

/// Run an orchestrator call with an upper bound on its duration
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    after: Duration,
    call: F,
) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, OrchestratorError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(OrchestratorError::Timeout { operation, after }),
    }
}
