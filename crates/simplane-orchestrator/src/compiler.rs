//! Manifest compilation
//!
//! Pure functions from scope, unit and upload requests to Kubernetes objects.
//! Nothing here talks to the API server.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use simplane_common::{StorageKind, CLEANUP_LABEL, JOB_ID_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, TENANT_LABEL};
use uuid::Uuid;

use crate::{
    results_claim_name, upload_unit_name, OrchestratorError, ScopeSpec, UnitSpec, UploadSpec,
    RESULTS_MOUNT_PATH, RESULT_FILE_MARKER,
};

/// Largest base64 chunk stored in one ConfigMap (ConfigMaps cap at 1 MiB)
pub const PAYLOAD_CHUNK_CHARS: usize = 900_000;

/// Payload chunks are mounted under this directory, one subdirectory each
const PAYLOAD_MOUNT_ROOT: &str = "/config";

/// Key holding the chunk data inside each payload ConfigMap
const PAYLOAD_KEY: &str = "chunk";

const WORKSPACE: &str = "/workspace";

// =============================================================================
// Scope
// =============================================================================

/// Server-side-apply bodies for a tenant scope, in apply order
#[derive(Debug, Clone)]
pub struct CompiledScope {
    /// The namespace
    pub namespace: serde_json::Value,
    /// `<scope>-quota`
    pub quota: serde_json::Value,
    /// `<scope>-limits`
    pub limit_range: serde_json::Value,
    /// `results-<scope>`
    pub results_claim: serde_json::Value,
}

/// Name of a scope's ResourceQuota
pub fn quota_name(scope: &str) -> String {
    format!("{scope}-quota")
}

/// Name of a scope's LimitRange
pub fn limit_range_name(scope: &str) -> String {
    format!("{scope}-limits")
}

/// Build the objects that make up a tenant scope
///
/// The quota tracks the tenant's current limits; re-applying after a limits
/// change updates it in place.
pub fn compile_scope(scope: &ScopeSpec) -> CompiledScope {
    let cpu = scope.cpu_limit.to_string();
    let memory = format!("{}Gi", scope.memory_limit_gi);

    let namespace = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": scope.name,
            "labels": {
                MANAGED_BY_LABEL: MANAGED_BY_VALUE,
                TENANT_LABEL: scope.name,
            }
        }
    });

    let quota = serde_json::json!({
        "apiVersion": "v1",
        "kind": "ResourceQuota",
        "metadata": { "name": quota_name(&scope.name), "namespace": scope.name },
        "spec": {
            "hard": {
                "requests.cpu": cpu,
                "requests.memory": memory,
                "limits.cpu": cpu,
                "limits.memory": memory,
                "pods": scope.pod_cap.to_string(),
            }
        }
    });

    let limit_range = serde_json::json!({
        "apiVersion": "v1",
        "kind": "LimitRange",
        "metadata": { "name": limit_range_name(&scope.name), "namespace": scope.name },
        "spec": {
            "limits": [{
                "type": "Container",
                "max": { "cpu": cpu, "memory": memory },
                "default": { "cpu": "1", "memory": "2Gi" },
                "defaultRequest": { "cpu": "100m", "memory": "256Mi" },
            }]
        }
    });

    // storageClassName is omitted so the cluster default class applies
    let results_claim = serde_json::json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": { "name": results_claim_name(&scope.name), "namespace": scope.name },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": format!("{}Gi", scope.volume_size_gi) } },
        }
    });

    CompiledScope {
        namespace,
        quota,
        limit_range,
        results_claim,
    }
}

// =============================================================================
// Unit of work
// =============================================================================

/// Objects for one unit of work, in creation order
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    /// Payload chunks, created before the Job
    pub payload: Vec<ConfigMap>,
    /// The batch Job
    pub job: Job,
}

/// Split a payload into base64 chunks small enough for one ConfigMap each
pub fn payload_chunks(payload: &[u8]) -> Vec<String> {
    let encoded = STANDARD.encode(payload);
    encoded
        .as_bytes()
        .chunks(PAYLOAD_CHUNK_CHARS)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

/// Name of the `index`th payload ConfigMap of a unit
pub fn payload_object_name(unit_name: &str, index: usize) -> String {
    format!("{unit_name}-payload-{index}")
}

fn unit_labels(scope: &str, job_id: &Uuid) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (TENANT_LABEL.to_string(), scope.to_string()),
        (JOB_ID_LABEL.to_string(), job_id.to_string()),
    ])
}

/// Shell script that stages the inputs, runs the simulation and lists results
///
/// With a payload the archive is reassembled and unpacked into the workspace;
/// without one the bundled scenario `$SCENARIOS_DIR/$SCENARIO_ID` is copied
/// in. The config file comes from `$CONFIG_FILE`, or the first file ending in
/// `$CONFIG_SUFFIX` when none is named.
fn run_script(job_id: &Uuid, chunks: usize) -> String {
    let results_dir = format!("{RESULTS_MOUNT_PATH}/{job_id}");
    let marker = RESULT_FILE_MARKER;

    let stage = if chunks == 0 {
        r#"if [ ! -d "$SCENARIOS_DIR/$SCENARIO_ID" ]; then
    echo "no payload and no bundled scenario: $SCENARIOS_DIR/$SCENARIO_ID"
    exit 1
fi
cp -r "$SCENARIOS_DIR/$SCENARIO_ID/." .
"#
        .to_string()
    } else {
        format!(
            r#"echo "Reassembling input from {chunks} chunk(s)..."
for i in $(seq 0 {last}); do
    cat {PAYLOAD_MOUNT_ROOT}/chunk$i/{PAYLOAD_KEY} >> input.zip.b64
done
base64 -d input.zip.b64 > input.zip
rm input.zip.b64
unzip -q input.zip || python3 -m zipfile -e input.zip .
rm input.zip
"#,
            last = chunks - 1,
        )
    };

    format!(
        r#"#!/bin/sh
set -e
mkdir -p {WORKSPACE}
cd {WORKSPACE}
{stage}
if [ -z "$CONFIG_FILE" ]; then
    CONFIG_FILE=$(find . -name "*$CONFIG_SUFFIX" | sort | head -1)
fi
if [ -z "$CONFIG_FILE" ] || [ ! -f "$CONFIG_FILE" ]; then
    echo "config file not found: '$CONFIG_FILE' (suffix $CONFIG_SUFFIX)"
    exit 1
fi
OUTPUT_DIR=$(dirname "$CONFIG_FILE")

echo "Running simulation: sumo -c $CONFIG_FILE"
sumo -c "$CONFIG_FILE"

mkdir -p {results_dir}
cp "$OUTPUT_DIR"/*.xml "$OUTPUT_DIR"/*.txt "$OUTPUT_DIR"/*.log {results_dir}/ 2>/dev/null || true
find {results_dir} -type f | sed "s|^{results_dir}/|{marker}|"
"#
    )
}

/// Build the payload ConfigMaps and batch Job for a unit of work
pub fn compile_unit(unit: &UnitSpec) -> Result<CompiledUnit, OrchestratorError> {
    if unit.cpu_request == 0 || unit.memory_gi == 0 {
        return Err(OrchestratorError::InvalidManifest(format!(
            "unit {} requests zero resources",
            unit.name
        )));
    }

    if unit.payload.is_none() && unit.config_file.is_some() {
        return Err(OrchestratorError::InvalidManifest(format!(
            "unit {} names a config file but carries no payload",
            unit.name
        )));
    }

    let labels = unit_labels(&unit.scope, &unit.job_id);
    let chunks = unit.payload.as_deref().map(payload_chunks).unwrap_or_default();

    let mut cleanup_labels = labels.clone();
    cleanup_labels.insert(CLEANUP_LABEL.to_string(), "true".to_string());

    let payload: Vec<ConfigMap> = chunks
        .into_iter()
        .enumerate()
        .map(|(i, data)| ConfigMap {
            metadata: ObjectMeta {
                name: Some(payload_object_name(&unit.name, i)),
                namespace: Some(unit.scope.clone()),
                labels: Some(cleanup_labels.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(PAYLOAD_KEY.to_string(), data)])),
            ..Default::default()
        })
        .collect();

    let mut volumes = Vec::with_capacity(payload.len() + 1);
    let mut mounts = Vec::with_capacity(payload.len() + 1);
    for (i, cm) in payload.iter().enumerate() {
        let volume_name = format!("payload-{i}");
        volumes.push(Volume {
            name: volume_name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: cm.metadata.name.clone().unwrap_or_default(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: format!("{PAYLOAD_MOUNT_ROOT}/chunk{i}"),
            read_only: Some(true),
            ..Default::default()
        });
    }
    volumes.push(results_volume(&unit.scope));
    mounts.push(VolumeMount {
        name: "results".to_string(),
        mount_path: RESULTS_MOUNT_PATH.to_string(),
        ..Default::default()
    });

    let resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(unit.cpu_request.to_string())),
        ("memory".to_string(), Quantity(format!("{}Gi", unit.memory_gi))),
    ]);

    let mut env = unit.env.clone();
    env.insert("JOB_ID".to_string(), unit.job_id.to_string());
    env.insert("CONFIG_SUFFIX".to_string(), unit.config_suffix.clone());
    env.insert("SCENARIOS_DIR".to_string(), unit.scenarios_dir.clone());
    if let Some(config_file) = &unit.config_file {
        env.insert("CONFIG_FILE".to_string(), config_file.clone());
    }

    let container = Container {
        name: "simulation".to_string(),
        image: Some(unit.image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![run_script(&unit.job_id, payload.len())]),
        env: Some(env_vars(&env)),
        resources: Some(ResourceRequirements {
            requests: Some(resources.clone()),
            limits: Some(resources),
            ..Default::default()
        }),
        volume_mounts: Some(mounts),
        working_dir: Some(WORKSPACE.to_string()),
        ..Default::default()
    };

    let job = Job {
        metadata: ObjectMeta {
            name: Some(unit.name.clone()),
            namespace: Some(unit.scope.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(seconds_i64(unit.deadline)),
            ttl_seconds_after_finished: Some(seconds_i32(unit.finished_ttl)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    node_selector: if unit.node_selector.is_empty() {
                        None
                    } else {
                        Some(unit.node_selector.clone())
                    },
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(CompiledUnit { payload, job })
}

// =============================================================================
// Upload unit
// =============================================================================

/// Shell script that copies a job's results to an object store and lists them
fn upload_script(upload: &UploadSpec) -> Result<String, OrchestratorError> {
    let source = format!("{RESULTS_MOUNT_PATH}/{}", upload.job_id);
    let destination = &upload.destination;
    let copy = match upload.kind {
        StorageKind::S3 => format!("aws s3 cp --recursive {source} {destination}"),
        StorageKind::Gcs => format!("gsutil -m cp -r '{source}/*' {destination}"),
        StorageKind::Azure => format!(
            "az storage blob upload-batch --overwrite --account-name \"$AZURE_STORAGE_ACCOUNT\" \
             --destination \"$AZURE_CONTAINER\" --destination-path \"$DESTINATION_PREFIX\" \
             --source {source}"
        ),
        StorageKind::Volume => {
            return Err(OrchestratorError::InvalidManifest(
                "volume results are not uploaded".to_string(),
            ))
        }
    };
    let marker = RESULT_FILE_MARKER;
    // Runs only once the copy and the manifest succeeded (set -e)
    let remove = if upload.remove_source {
        format!("rm -rf {source}\necho \"removed volume copy {source}\"\n")
    } else {
        String::new()
    };

    Ok(format!(
        r#"#!/bin/sh
set -e
if [ ! -d {source} ]; then
    echo "results directory not found: {source}"
    exit 1
fi
{copy}
find {source} -type f | sed "s|^{source}/|{marker}|"
{remove}"#
    ))
}

/// Build the batch Job that stages a job's results to object storage
pub fn compile_upload(upload: &UploadSpec) -> Result<Job, OrchestratorError> {
    let script = upload_script(upload)?;
    let labels = unit_labels(&upload.scope, &upload.job_id);

    let mut env = upload.env.clone();
    env.insert("JOB_ID".to_string(), upload.job_id.to_string());
    env.insert("DESTINATION".to_string(), upload.destination.clone());

    let container = Container {
        name: "upload".to_string(),
        image: Some(upload.image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![script]),
        env: Some(env_vars(&env)),
        volume_mounts: Some(vec![VolumeMount {
            name: "results".to_string(),
            mount_path: RESULTS_MOUNT_PATH.to_string(),
            read_only: Some(!upload.remove_source),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(upload_unit_name(&upload.job_id)),
            namespace: Some(upload.scope.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            active_deadline_seconds: Some(seconds_i64(upload.deadline)),
            ttl_seconds_after_finished: Some(seconds_i32(upload.finished_ttl)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![results_volume(&upload.scope)]),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn results_volume(scope: &str) -> Volume {
    Volume {
        name: "results".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: results_claim_name(scope),
            read_only: Some(false),
        }),
        ..Default::default()
    }
}

fn env_vars(env: &BTreeMap<String, String>) -> Vec<EnvVar> {
    env.iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect()
}

fn seconds_i64(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

fn seconds_i32(d: std::time::Duration) -> i32 {
    i32::try_from(d.as_secs()).unwrap_or(i32::MAX)
}
