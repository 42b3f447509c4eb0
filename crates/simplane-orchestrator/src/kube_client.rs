//! Kubernetes implementation of [`Orchestrator`]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, LimitRange, Namespace, Node, PersistentVolumeClaim, Pod, ResourceQuota,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use simplane_common::{CLEANUP_LABEL, JOB_ID_LABEL};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compiler::{compile_scope, compile_unit, compile_upload, limit_range_name, quota_name};
use crate::{
    results_claim_name, upload_unit_name, AncillaryRef, NodeInfo, Orchestrator,
    OrchestratorError, ScopeSpec, UnitHandle, UnitSpec, UnitState, UploadSpec, FIELD_MANAGER,
};

/// Create a kube client from an optional kubeconfig path with explicit timeouts
///
/// Without a path the in-cluster service account (or `KUBECONFIG`) is used.
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, OrchestratorError> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                OrchestratorError::Unavailable(format!("failed to read kubeconfig: {e}"))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    OrchestratorError::Unavailable(format!("failed to load kubeconfig: {e}"))
                })?
        }
        None => Config::infer().await.map_err(|e| {
            OrchestratorError::Unavailable(format!("failed to infer config: {e}"))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config)
        .map_err(|e| OrchestratorError::Unavailable(format!("failed to create client: {e}")))
}

/// [`Orchestrator`] backed by a Kubernetes cluster
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    async fn delete_payload(&self, scope: &str, names: &[String]) {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), scope);
        for name in names {
            if let Err(e) = api.delete(name, &DeleteParams::default()).await {
                let e = OrchestratorError::from(e);
                if !e.is_not_found() {
                    warn!(scope = %scope, name = %name, error = %e, "failed to remove payload object");
                }
            }
        }
    }
}

fn quantity_map(map: Option<BTreeMap<String, Quantity>>) -> BTreeMap<String, String> {
    map.unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect()
}

fn state_of(job: &Job) -> UnitState {
    let Some(status) = job.status.as_ref() else {
        return UnitState::waiting();
    };
    let has_condition = |kind: &str| {
        status
            .conditions
            .as_ref()
            .map(|cs| cs.iter().any(|c| c.type_ == kind && c.status == "True"))
            .unwrap_or(false)
    };

    let mut state = UnitState {
        exists: true,
        active: status.active.unwrap_or(0).max(0) as u32,
        succeeded: status.succeeded.unwrap_or(0).max(0) as u32,
        failed: status.failed.unwrap_or(0).max(0) as u32,
    };
    // DeadlineExceeded sets the Failed condition without always bumping the counter
    if has_condition("Failed") && state.failed == 0 {
        state.failed = 1;
    }
    if has_condition("Complete") && state.succeeded == 0 {
        state.succeeded = 1;
    }
    state
}

fn node_info(node: Node) -> NodeInfo {
    let spec = node.spec.unwrap_or_default();
    let status = node.status.unwrap_or_default();
    let ready = status
        .conditions
        .as_ref()
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false);
    NodeInfo {
        name: node.metadata.name.unwrap_or_default(),
        labels: node.metadata.labels.unwrap_or_default(),
        provider_id: spec.provider_id,
        capacity: quantity_map(status.capacity),
        allocatable: quantity_map(status.allocatable),
        ready,
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn ensure_scope(&self, scope: &ScopeSpec) -> Result<(), OrchestratorError> {
        let compiled = compile_scope(scope);
        let params = Self::apply_params();

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        namespaces
            .patch(&scope.name, &params, &Patch::Apply(&compiled.namespace))
            .await?;

        let quotas: Api<ResourceQuota> = Api::namespaced(self.client.clone(), &scope.name);
        quotas
            .patch(&quota_name(&scope.name), &params, &Patch::Apply(&compiled.quota))
            .await?;

        let ranges: Api<LimitRange> = Api::namespaced(self.client.clone(), &scope.name);
        ranges
            .patch(
                &limit_range_name(&scope.name),
                &params,
                &Patch::Apply(&compiled.limit_range),
            )
            .await?;

        // A bound claim cannot shrink, so an existing claim is left untouched
        let claims: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &scope.name);
        let claim_name = results_claim_name(&scope.name);
        if claims.get_opt(&claim_name).await?.is_none() {
            claims
                .patch(&claim_name, &params, &Patch::Apply(&compiled.results_claim))
                .await?;
            info!(scope = %scope.name, claim = %claim_name, "created results volume claim");
        }

        debug!(scope = %scope.name, tenant = %scope.tenant_id, "scope applied");
        Ok(())
    }

    async fn submit_unit(&self, unit: &UnitSpec) -> Result<UnitHandle, OrchestratorError> {
        let compiled = compile_unit(unit)?;
        let params = Self::apply_params();

        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &unit.scope);
        let mut created = Vec::with_capacity(compiled.payload.len());
        for cm in &compiled.payload {
            let name = cm.metadata.name.clone().unwrap_or_default();
            if let Err(e) = config_maps.patch(&name, &params, &Patch::Apply(cm)).await {
                self.delete_payload(&unit.scope, &created).await;
                return Err(e.into());
            }
            created.push(name);
        }

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &unit.scope);
        if let Err(e) = jobs
            .patch(&unit.name, &params, &Patch::Apply(&compiled.job))
            .await
        {
            self.delete_payload(&unit.scope, &created).await;
            return Err(e.into());
        }

        info!(
            scope = %unit.scope,
            unit = %unit.name,
            job_id = %unit.job_id,
            payload_chunks = created.len(),
            "unit submitted"
        );
        Ok(UnitHandle {
            scope: unit.scope.clone(),
            name: unit.name.clone(),
            ancillary: created,
        })
    }

    async fn unit_state(&self, scope: &str, name: &str) -> Result<UnitState, OrchestratorError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), scope);
        match jobs.get_opt(name).await? {
            Some(job) => Ok(state_of(&job)),
            None => Ok(UnitState::missing()),
        }
    }

    async fn read_recent_output(
        &self,
        scope: &str,
        unit_name: &str,
        max_lines: u32,
    ) -> Result<String, OrchestratorError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), scope);
        let list = pods
            .list(&ListParams::default().labels(&format!("job-name={unit_name}")))
            .await?;

        let newest = list
            .items
            .into_iter()
            .max_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .and_then(|p| p.metadata.name)
            .ok_or_else(|| OrchestratorError::not_found("pod", unit_name))?;

        let params = LogParams {
            tail_lines: Some(i64::from(max_lines)),
            ..Default::default()
        };
        Ok(pods.logs(&newest, &params).await?)
    }

    async fn list_ancillary(&self) -> Result<Vec<AncillaryRef>, OrchestratorError> {
        let api: Api<ConfigMap> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(&format!("{CLEANUP_LABEL}=true")))
            .await?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|cm| {
                let meta = cm.metadata;
                let job_id = meta
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(JOB_ID_LABEL))
                    .and_then(|v| Uuid::parse_str(v).ok());
                Some(AncillaryRef {
                    scope: meta.namespace?,
                    name: meta.name?,
                    job_id,
                    created_at: meta.creation_timestamp.map(|t| t.0),
                })
            })
            .collect())
    }

    async fn delete_ancillary(&self, scope: &str, name: &str) -> Result<(), OrchestratorError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), scope);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn submit_upload(&self, upload: &UploadSpec) -> Result<(), OrchestratorError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &upload.scope);
        let name = upload_unit_name(&upload.job_id);
        if jobs.get_opt(&name).await?.is_some() {
            debug!(scope = %upload.scope, unit = %name, "upload unit already exists");
            return Ok(());
        }

        let job = compile_upload(upload)?;
        match jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(
                    scope = %upload.scope,
                    job_id = %upload.job_id,
                    backend = %upload.kind,
                    destination = %upload.destination,
                    "upload unit submitted"
                );
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, OrchestratorError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(node_info).collect())
    }
}
