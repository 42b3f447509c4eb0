//! Result location resolution
//!
//! Every job writes its outputs to `/results/<job_id>` on the tenant's shared
//! results volume. When the cluster sits on a cloud with a configured bucket,
//! a one-shot upload unit copies them to object storage, removes the volume
//! copy, and the bucket prefix becomes the recorded location. Otherwise the
//! volume path is recorded. An upload that fails or outlives its deadline
//! leaves the results on the volume, which is then recorded instead.
//!
//! Resolution is eventually consistent: [`Resolution::Pending`] means "look
//! again next cycle", never a failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use simplane_common::config::{ReconcilerSettings, StorageMode, StorageSettings};
use simplane_common::metrics;
use simplane_common::{Job, JobStatus, ResultLocation, Result, StorageKind};
use simplane_orchestrator::{
    parse_result_files, results_claim_name, upload_unit_name, NodeInfo, Orchestrator,
    UploadSpec,
};
use simplane_store::{JobStore, Store};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::bounded;

/// Outcome of one resolution attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Location and file list are known
    Resolved(ResultLocation),
    /// Outputs are not observable yet
    Pending,
}

/// Cloud a cluster runs on, as far as node metadata tells
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cloud {
    Gke,
    Aws,
    Azure,
}

fn cloud_of(node: &NodeInfo) -> Option<Cloud> {
    let provider = node.provider_id.as_deref().unwrap_or_default();
    let hostname = node
        .labels
        .get("kubernetes.io/hostname")
        .map(String::as_str)
        .unwrap_or_default();
    let has_label = |prefix: &str| node.labels.keys().any(|k| k.starts_with(prefix));

    if provider.starts_with("gce://") || has_label("cloud.google.com/gke") || hostname.contains("gke")
    {
        Some(Cloud::Gke)
    } else if provider.starts_with("aws://")
        || has_label("eks.amazonaws.com/")
        || hostname.contains("eks")
        || hostname.contains("ec2")
    {
        Some(Cloud::Aws)
    } else if provider.starts_with("azure://")
        || has_label("kubernetes.azure.com/")
        || hostname.contains("aks")
    {
        Some(Cloud::Azure)
    } else {
        None
    }
}

/// Whether the settings carry what `kind` needs to address objects
fn backend_configured(kind: StorageKind, settings: &StorageSettings) -> bool {
    match kind {
        StorageKind::Volume => true,
        StorageKind::S3 | StorageKind::Gcs => settings.bucket.is_some(),
        StorageKind::Azure => {
            settings.azure_account.is_some() && settings.azure_container.is_some()
        }
    }
}

/// Pick a storage backend from node metadata
///
/// The first node that identifies a cloud decides; an object store is chosen
/// only when its bucket or container is configured.
pub fn detect_backend(nodes: &[NodeInfo], settings: &StorageSettings) -> StorageKind {
    let kind = match nodes.iter().find_map(cloud_of) {
        Some(Cloud::Gke) => StorageKind::Gcs,
        Some(Cloud::Aws) => StorageKind::S3,
        Some(Cloud::Azure) => StorageKind::Azure,
        None => StorageKind::Volume,
    };
    if backend_configured(kind, settings) {
        kind
    } else {
        StorageKind::Volume
    }
}

/// Decides where a job's outputs live and records the decision once
pub struct ResultResolver {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    settings: StorageSettings,
    output_lines: u32,
    call_timeout: Duration,
    upload_ttl: Duration,
    backend: OnceCell<StorageKind>,
}

impl ResultResolver {
    /// Create a resolver
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        settings: StorageSettings,
        reconciler: &ReconcilerSettings,
        upload_ttl: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            settings,
            output_lines: reconciler.output_lines,
            call_timeout: reconciler.call_timeout,
            upload_ttl,
            backend: OnceCell::new(),
        }
    }

    /// The storage backend in use, detected on first call
    ///
    /// A failed detection falls back to the volume for this call only and is
    /// retried on the next.
    pub async fn backend(&self) -> StorageKind {
        let detected = self
            .backend
            .get_or_try_init(|| async {
                let kind = match self.settings.mode {
                    StorageMode::Fixed(kind) if backend_configured(kind, &self.settings) => kind,
                    StorageMode::Fixed(kind) => {
                        warn!(backend = %kind, "storage backend is not configured, using volume");
                        StorageKind::Volume
                    }
                    StorageMode::Auto => {
                        let nodes = bounded(
                            "list_nodes",
                            self.call_timeout,
                            self.orchestrator.list_nodes(),
                        )
                        .await?;
                        detect_backend(&nodes, &self.settings)
                    }
                };
                info!(backend = %kind, "result storage backend selected");
                Ok::<_, simplane_orchestrator::OrchestratorError>(kind)
            })
            .await;

        match detected {
            Ok(kind) => *kind,
            Err(e) => {
                warn!(error = %e, "storage backend detection failed, using volume for now");
                StorageKind::Volume
            }
        }
    }

    fn volume_uri(job: &Job) -> String {
        format!("pvc://{}/{}", results_claim_name(&job.namespace), job.job_id)
    }

    fn object_uri(&self, kind: StorageKind, job: &Job) -> String {
        let prefix = format!("results/{}/{}/", job.namespace, job.job_id);
        let bucket = self.settings.bucket.as_deref().unwrap_or_default();
        match kind {
            StorageKind::S3 => format!("s3://{bucket}/{prefix}"),
            StorageKind::Gcs => format!("gs://{bucket}/{prefix}"),
            StorageKind::Azure => format!(
                "https://{}.blob.core.windows.net/{}/{prefix}",
                self.settings.azure_account.as_deref().unwrap_or_default(),
                self.settings.azure_container.as_deref().unwrap_or_default(),
            ),
            StorageKind::Volume => Self::volume_uri(job),
        }
    }

    fn upload_env(&self, job: &Job) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(region) = &self.settings.region {
            env.insert("AWS_REGION".to_string(), region.clone());
        }
        if let Some(account) = &self.settings.azure_account {
            env.insert("AZURE_STORAGE_ACCOUNT".to_string(), account.clone());
        }
        if let Some(container) = &self.settings.azure_container {
            env.insert("AZURE_CONTAINER".to_string(), container.clone());
        }
        env.insert(
            "DESTINATION_PREFIX".to_string(),
            format!("results/{}/{}/", job.namespace, job.job_id),
        );
        env
    }

    /// Files listed in a unit's output; a unit whose output is gone lists none
    async fn listed_files(&self, job: &Job, unit_name: &str) -> Result<Vec<String>> {
        match bounded(
            "read_recent_output",
            self.call_timeout,
            self.orchestrator
                .read_recent_output(&job.namespace, unit_name, self.output_lines),
        )
        .await
        {
            Ok(output) => Ok(parse_result_files(&output)),
            Err(e) if e.is_not_found() => {
                debug!(job_id = %job.job_id, unit = %unit_name, "unit output no longer available");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into_error("read_recent_output")),
        }
    }

    async fn volume_location(&self, job: &Job) -> Result<ResultLocation> {
        Ok(ResultLocation {
            kind: StorageKind::Volume,
            uri: Self::volume_uri(job),
            files: self.listed_files(job, &job.unit_name).await?,
        })
    }

    async fn object_location(&self, kind: StorageKind, job: &Job) -> Result<Resolution> {
        let upload_name = upload_unit_name(&job.job_id);
        let state = bounded(
            "unit_state",
            self.call_timeout,
            self.orchestrator.unit_state(&job.namespace, &upload_name),
        )
        .await
        .map_err(|e| e.into_error("unit_state"))?;

        if !state.exists {
            let upload = UploadSpec {
                scope: job.namespace.clone(),
                job_id: job.job_id,
                kind,
                destination: self.object_uri(kind, job),
                image: self.settings.uploader_image.clone(),
                env: self.upload_env(job),
                finished_ttl: self.upload_ttl,
                deadline: self.settings.upload_deadline,
                remove_source: !self.settings.keep_volume_copy,
            };
            bounded(
                "submit_upload",
                self.call_timeout,
                self.orchestrator.submit_upload(&upload),
            )
            .await
            .map_err(|e| e.into_error("submit_upload"))?;
            return Ok(Resolution::Pending);
        }

        if state.succeeded > 0 {
            return Ok(Resolution::Resolved(ResultLocation {
                kind,
                uri: self.object_uri(kind, job),
                files: self.listed_files(job, &upload_name).await?,
            }));
        }
        if state.failed > 0 {
            warn!(job_id = %job.job_id, backend = %kind, "result upload failed, keeping results on the volume");
            return Ok(Resolution::Resolved(self.volume_location(job).await?));
        }
        Ok(Resolution::Pending)
    }

    /// Decide where a job's outputs live without recording anything
    ///
    /// Already-resolved jobs return their stored location; non-terminal jobs
    /// are always `Pending`.
    pub async fn resolve(&self, job: &Job) -> Result<Resolution> {
        if let Some(stored) = &job.result {
            return Ok(Resolution::Resolved(stored.clone()));
        }
        match job.status {
            JobStatus::Pending | JobStatus::Running => Ok(Resolution::Pending),
            JobStatus::Failed => Ok(Resolution::Resolved(self.volume_location(job).await?)),
            JobStatus::Succeeded => match self.backend().await {
                StorageKind::Volume => Ok(Resolution::Resolved(self.volume_location(job).await?)),
                kind => self.object_location(kind, job).await,
            },
        }
    }

    /// Resolve and persist a job's result location
    ///
    /// Idempotent: when another writer recorded a location first, the stored
    /// value is returned unchanged.
    pub async fn resolve_and_record(&self, job: &Job) -> Result<Resolution> {
        if job.result.is_some() {
            return self.resolve(job).await;
        }

        let location = match self.resolve(job).await {
            Ok(Resolution::Resolved(location)) => location,
            Ok(Resolution::Pending) => {
                metrics::record_resolution("pending");
                return Ok(Resolution::Pending);
            }
            Err(e) => {
                metrics::record_resolution("error");
                return Err(e);
            }
        };

        if self.store.set_result_location(job.job_id, &location).await? {
            metrics::record_resolution("resolved");
            info!(
                job_id = %job.job_id,
                backend = %location.kind,
                uri = %location.uri,
                files = location.files.len(),
                "result location recorded"
            );
            return Ok(Resolution::Resolved(location));
        }

        match self.store.get_job(job.job_id).await? {
            Some(Job {
                result: Some(stored),
                ..
            }) => Ok(Resolution::Resolved(stored)),
            _ => Ok(Resolution::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use simplane_orchestrator::{FakeOrchestrator, UnitState};
    use simplane_store::MemoryStore;

    fn node(provider: Option<&str>, labels: &[(&str, &str)]) -> NodeInfo {
        NodeInfo {
            name: "node-1".to_string(),
            provider_id: provider.map(String::from),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn with_bucket() -> StorageSettings {
        StorageSettings {
            bucket: Some("sim-results".to_string()),
            ..Default::default()
        }
    }

    mod detection {
        use super::*;

        #[test]
        fn test_clouds_map_to_their_object_store_when_configured() {
            let gke = node(Some("gce://proj/us-central1-a/gke-pool-1"), &[]);
            let eks = node(None, &[("eks.amazonaws.com/nodegroup", "sim")]);
            assert_eq!(detect_backend(&[gke], &with_bucket()), StorageKind::Gcs);
            assert_eq!(detect_backend(&[eks], &with_bucket()), StorageKind::S3);

            let aks = node(Some("azure:///subscriptions/x/vm-1"), &[]);
            let azure = StorageSettings {
                azure_account: Some("acct".to_string()),
                azure_container: Some("results".to_string()),
                ..Default::default()
            };
            assert_eq!(detect_backend(&[aks], &azure), StorageKind::Azure);
        }

        #[test]
        fn test_unconfigured_or_unknown_clouds_use_the_volume() {
            let gke = node(None, &[("cloud.google.com/gke-nodepool", "sim")]);
            assert_eq!(
                detect_backend(&[gke], &StorageSettings::default()),
                StorageKind::Volume
            );
            let kind = node(None, &[("kubernetes.io/hostname", "kind-control-plane")]);
            assert_eq!(detect_backend(&[kind], &with_bucket()), StorageKind::Volume);
            assert_eq!(detect_backend(&[], &with_bucket()), StorageKind::Volume);
        }

        /// Story: detection runs once; later calls use the cached answer even
        /// if the node list changes
        #[tokio::test]
        async fn story_detection_is_cached() {
            let fake = Arc::new(FakeOrchestrator::new());
            fake.set_nodes(vec![node(Some("aws:///us-east-1a/i-0abc"), &[])]);
            let resolver = ResultResolver::new(
                Arc::new(MemoryStore::new()),
                fake.clone(),
                with_bucket(),
                &ReconcilerSettings::default(),
                Duration::from_secs(120),
            );

            assert_eq!(resolver.backend().await, StorageKind::S3);
            fake.set_nodes(vec![]);
            assert_eq!(resolver.backend().await, StorageKind::S3);
            assert_eq!(fake.calls("list_nodes"), 1);
        }

        #[tokio::test]
        async fn test_failed_detection_is_retried() {
            let fake = Arc::new(FakeOrchestrator::new());
            fake.set_unavailable(true);
            let resolver = ResultResolver::new(
                Arc::new(MemoryStore::new()),
                fake.clone(),
                with_bucket(),
                &ReconcilerSettings::default(),
                Duration::from_secs(120),
            );
            assert_eq!(resolver.backend().await, StorageKind::Volume);

            fake.set_unavailable(false);
            fake.set_nodes(vec![node(Some("gce://p/z/n"), &[])]);
            assert_eq!(resolver.backend().await, StorageKind::Gcs);
        }
    }

    mod resolution {
        use super::*;

        fn finished_job(status: JobStatus) -> Job {
            let mut job = Job::new("acme", "acme", 1, 1, Default::default(), Utc::now());
            job.status = status;
            job
        }

        fn resolver(fake: Arc<FakeOrchestrator>, settings: StorageSettings) -> ResultResolver {
            ResultResolver::new(
                Arc::new(MemoryStore::new()),
                fake,
                settings,
                &ReconcilerSettings::default(),
                Duration::from_secs(120),
            )
        }

        #[tokio::test]
        async fn test_volume_location_lists_files_from_output() {
            let fake = Arc::new(FakeOrchestrator::new());
            let job = finished_job(JobStatus::Succeeded);
            fake.set_output(
                "acme",
                &job.unit_name,
                "sumo done\nsimplane-result-file: tripinfo.xml\nsimplane-result-file: summary.xml",
            );
            let resolver = resolver(fake, StorageSettings::default());

            let Resolution::Resolved(location) = resolver.resolve(&job).await.unwrap() else {
                panic!("expected a resolved location");
            };
            assert_eq!(location.kind, StorageKind::Volume);
            assert_eq!(location.uri, format!("pvc://results-acme/{}", job.job_id));
            assert_eq!(location.files, vec!["tripinfo.xml", "summary.xml"]);
        }

        #[tokio::test]
        async fn test_gone_output_resolves_with_no_files() {
            let fake = Arc::new(FakeOrchestrator::new());
            let job = finished_job(JobStatus::Failed);
            let resolver = resolver(fake, with_bucket());

            let Resolution::Resolved(location) = resolver.resolve(&job).await.unwrap() else {
                panic!("expected a resolved location");
            };
            // Failed jobs are never staged
            assert_eq!(location.kind, StorageKind::Volume);
            assert!(location.files.is_empty());
        }

        #[tokio::test]
        async fn test_in_flight_jobs_are_pending() {
            let fake = Arc::new(FakeOrchestrator::new());
            let resolver = resolver(fake.clone(), StorageSettings::default());
            assert_eq!(
                resolver.resolve(&finished_job(JobStatus::Running)).await.unwrap(),
                Resolution::Pending
            );
            assert_eq!(fake.calls("read_recent_output"), 0);
        }

        /// Story: object-store results stay pending until the upload unit
        /// finishes, then resolve to the bucket prefix with its manifest
        #[tokio::test]
        async fn story_upload_then_resolve() {
            let fake = Arc::new(FakeOrchestrator::new());
            let job = finished_job(JobStatus::Succeeded);
            let resolver = resolver(
                fake.clone(),
                StorageSettings {
                    mode: StorageMode::Fixed(StorageKind::S3),
                    region: Some("us-east-1".to_string()),
                    ..with_bucket()
                },
            );

            assert_eq!(resolver.resolve(&job).await.unwrap(), Resolution::Pending);
            let uploads = fake.uploads();
            assert_eq!(uploads.len(), 1);
            assert_eq!(
                uploads[0].destination,
                format!("s3://sim-results/results/acme/{}/", job.job_id)
            );
            assert_eq!(uploads[0].env["AWS_REGION"], "us-east-1");
            assert_eq!(uploads[0].deadline, Duration::from_secs(30 * 60));
            // Successful uploads free the tenant's results volume
            assert!(uploads[0].remove_source);

            // Still running: no second upload
            assert_eq!(resolver.resolve(&job).await.unwrap(), Resolution::Pending);
            assert_eq!(fake.uploads().len(), 1);

            let upload_name = upload_unit_name(&job.job_id);
            fake.set_unit_state("acme", &upload_name, UnitState::succeeded());
            fake.set_output("acme", &upload_name, "simplane-result-file: tripinfo.xml");
            let Resolution::Resolved(location) = resolver.resolve(&job).await.unwrap() else {
                panic!("expected a resolved location");
            };
            assert_eq!(location.kind, StorageKind::S3);
            assert_eq!(location.files, vec!["tripinfo.xml"]);
        }

        #[tokio::test]
        async fn test_failed_upload_falls_back_to_volume() {
            let fake = Arc::new(FakeOrchestrator::new());
            let job = finished_job(JobStatus::Succeeded);
            fake.set_unit_state("acme", &upload_unit_name(&job.job_id), UnitState::failed());
            let resolver = resolver(
                fake,
                StorageSettings {
                    mode: StorageMode::Fixed(StorageKind::Gcs),
                    ..with_bucket()
                },
            );

            let Resolution::Resolved(location) = resolver.resolve(&job).await.unwrap() else {
                panic!("expected a resolved location");
            };
            assert_eq!(location.kind, StorageKind::Volume);
        }

        #[tokio::test]
        async fn test_volume_copy_can_be_kept() {
            let fake = Arc::new(FakeOrchestrator::new());
            let job = finished_job(JobStatus::Succeeded);
            let resolver = resolver(
                fake.clone(),
                StorageSettings {
                    mode: StorageMode::Fixed(StorageKind::S3),
                    keep_volume_copy: true,
                    upload_deadline: Duration::from_secs(600),
                    ..with_bucket()
                },
            );

            assert_eq!(resolver.resolve(&job).await.unwrap(), Resolution::Pending);
            let uploads = fake.uploads();
            assert!(!uploads[0].remove_source);
            assert_eq!(uploads[0].deadline, Duration::from_secs(600));
        }

        /// Story: an upload that never runs is ended by its deadline, and the
        /// job then resolves to the volume instead of staying pending
        #[tokio::test]
        async fn story_stuck_upload_ends_on_the_volume() {
            let fake = Arc::new(FakeOrchestrator::new());
            let job = finished_job(JobStatus::Succeeded);
            fake.set_output(
                "acme",
                &job.unit_name,
                "simplane-result-file: tripinfo.xml",
            );
            let resolver = resolver(
                fake.clone(),
                StorageSettings {
                    mode: StorageMode::Fixed(StorageKind::S3),
                    ..with_bucket()
                },
            );

            assert_eq!(resolver.resolve(&job).await.unwrap(), Resolution::Pending);
            let upload_name = upload_unit_name(&job.job_id);
            fake.set_unit_state("acme", &upload_name, UnitState::waiting());
            assert_eq!(resolver.resolve(&job).await.unwrap(), Resolution::Pending);

            // DeadlineExceeded surfaces as a failed attempt
            fake.set_unit_state("acme", &upload_name, UnitState::failed());
            let Resolution::Resolved(location) = resolver.resolve(&job).await.unwrap() else {
                panic!("expected a resolved location");
            };
            assert_eq!(location.kind, StorageKind::Volume);
            assert_eq!(location.files, vec!["tripinfo.xml"]);
            assert_eq!(fake.uploads().len(), 1);
        }

        #[tokio::test]
        async fn test_stored_location_is_returned_without_calls() {
            let fake = Arc::new(FakeOrchestrator::new());
            let mut job = finished_job(JobStatus::Succeeded);
            let stored = ResultLocation {
                kind: StorageKind::Volume,
                uri: "pvc://results-acme/x".to_string(),
                files: vec!["a.xml".to_string()],
            };
            job.result = Some(stored.clone());
            let resolver = resolver(fake.clone(), StorageSettings::default());

            assert_eq!(
                resolver.resolve_and_record(&job).await.unwrap(),
                Resolution::Resolved(stored)
            );
            assert_eq!(fake.calls("read_recent_output"), 0);
        }
    }
}
