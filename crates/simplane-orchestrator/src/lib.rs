//! Orchestrator client for simplane
//!
//! The control plane never runs simulations itself. It issues declarative
//! "run this", "what is its state", "delete this" requests through the
//! [`Orchestrator`] trait. [`KubeOrchestrator`] maps those onto Kubernetes
//! namespaces, batch Jobs and ConfigMaps; the `testing` feature adds a scripted
//! in-memory implementation.

#![deny(missing_docs)]

pub mod compiler;
mod error;
#[cfg(any(test, feature = "testing"))]
mod fake;
mod kube_client;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use simplane_common::StorageKind;
use uuid::Uuid;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

pub use error::OrchestratorError;
#[cfg(any(test, feature = "testing"))]
pub use fake::FakeOrchestrator;
pub use kube_client::{create_client_with_timeout, KubeOrchestrator};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "simplane-controller";

/// Output line prefix naming one result file
pub const RESULT_FILE_MARKER: &str = "simplane-result-file: ";

/// Mount path of the tenant results volume inside units
pub const RESULTS_MOUNT_PATH: &str = "/results";

/// Name of a tenant's results volume claim
pub fn results_claim_name(scope: &str) -> String {
    format!("results-{scope}")
}

/// Name of the upload unit that stages a job's results to object storage
pub fn upload_unit_name(job_id: &Uuid) -> String {
    format!("upload-{}", job_id.simple())
}

/// Extract result file names from unit output
pub fn parse_result_files(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(RESULT_FILE_MARKER.trim_end()))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

/// Desired isolated execution scope for a tenant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeSpec {
    /// Namespace name
    pub name: String,
    /// Owning tenant
    pub tenant_id: String,
    /// Aggregate CPU ceiling in cores
    pub cpu_limit: u32,
    /// Aggregate memory ceiling in GiB
    pub memory_limit_gi: u32,
    /// Maximum pods in the scope
    pub pod_cap: u32,
    /// Size of the results volume in GiB
    pub volume_size_gi: u32,
}

/// A unit of work to submit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitSpec {
    /// Scope to run in
    pub scope: String,
    /// Deterministic unit name
    pub name: String,
    /// Owning job
    pub job_id: Uuid,
    /// CPU cores requested (and limited to)
    pub cpu_request: u32,
    /// Memory in GiB requested (and limited to)
    pub memory_gi: u32,
    /// Environment passed to the container
    pub env: BTreeMap<String, String>,
    /// Input archive delivered through ancillary objects
    pub payload: Option<Vec<u8>>,
    /// Config file inside the payload to run, as validated at admission
    pub config_file: Option<String>,
    /// Suffix of a runnable config file, used when none is named
    pub config_suffix: String,
    /// Image directory holding bundled scenarios, staged when there is no payload
    pub scenarios_dir: String,
    /// Container image
    pub image: String,
    /// Hard wall-clock deadline
    pub deadline: Duration,
    /// Delay before the orchestrator deletes the finished unit
    pub finished_ttl: Duration,
    /// Node selector
    pub node_selector: BTreeMap<String, String>,
}

/// Handle returned for a submitted unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitHandle {
    /// Scope the unit runs in
    pub scope: String,
    /// Unit name
    pub name: String,
    /// Ancillary objects created for the unit
    pub ancillary: Vec<String>,
}

/// Request to copy a job's results from the volume to an object store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSpec {
    /// Scope holding the results volume
    pub scope: String,
    /// Job whose results are copied
    pub job_id: Uuid,
    /// Destination backend
    pub kind: StorageKind,
    /// Destination prefix, e.g. `s3://bucket/results/acme/<job>/`
    pub destination: String,
    /// Uploader image
    pub image: String,
    /// Extra environment for the uploader (region, account)
    pub env: BTreeMap<String, String>,
    /// Delay before the orchestrator deletes the finished upload unit
    pub finished_ttl: Duration,
    /// Hard wall-clock deadline of the upload unit
    pub deadline: Duration,
    /// Delete the volume copy once the upload succeeded
    pub remove_source: bool,
}

/// Observed state of a unit of work
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnitState {
    /// Whether the orchestrator still knows the unit
    pub exists: bool,
    /// Active execution attempts
    pub active: u32,
    /// Successful completions
    pub succeeded: u32,
    /// Failed attempts (including deadline exceeded)
    pub failed: u32,
}

impl UnitState {
    /// The unit is unknown to the orchestrator
    pub fn missing() -> Self {
        Self::default()
    }

    /// The unit exists but nothing has started
    pub fn waiting() -> Self {
        Self {
            exists: true,
            ..Self::default()
        }
    }

    /// One attempt is active
    pub fn active() -> Self {
        Self {
            exists: true,
            active: 1,
            ..Self::default()
        }
    }

    /// The unit completed successfully
    pub fn succeeded() -> Self {
        Self {
            exists: true,
            succeeded: 1,
            ..Self::default()
        }
    }

    /// The unit failed
    pub fn failed() -> Self {
        Self {
            exists: true,
            failed: 1,
            ..Self::default()
        }
    }
}

/// An ancillary object (payload chunk) eligible for cleanup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AncillaryRef {
    /// Scope holding the object
    pub scope: String,
    /// Object name
    pub name: String,
    /// Owning job, if labeled
    pub job_id: Option<Uuid>,
    /// Creation time, if known
    pub created_at: Option<DateTime<Utc>>,
}

/// Node summary for the administrative cluster view and backend detection
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Cloud provider id (e.g. `aws:///us-east-1a/i-0abc`)
    pub provider_id: Option<String>,
    /// Total capacity by resource
    pub capacity: BTreeMap<String, String>,
    /// Allocatable capacity by resource
    pub allocatable: BTreeMap<String, String>,
    /// Whether the Ready condition is True
    pub ready: bool,
}

/// Operations the control plane needs from the external orchestrator
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create or refresh a tenant's isolated execution scope
    ///
    /// Idempotent. An existing scope is left in place and its ceilings are
    /// updated to match `scope`.
    async fn ensure_scope(&self, scope: &ScopeSpec) -> Result<(), OrchestratorError>;

    /// Submit a unit of work, creating its ancillary payload objects first
    ///
    /// On failure, ancillary objects created by this call are removed.
    async fn submit_unit(&self, unit: &UnitSpec) -> Result<UnitHandle, OrchestratorError>;

    /// Read the current state of a unit; a missing unit is `exists: false`
    async fn unit_state(&self, scope: &str, name: &str) -> Result<UnitState, OrchestratorError>;

    /// Read the last `max_lines` lines of a unit's output
    ///
    /// Returns `NotFound` when the unit or its execution is gone.
    async fn read_recent_output(
        &self,
        scope: &str,
        unit_name: &str,
        max_lines: u32,
    ) -> Result<String, OrchestratorError>;

    /// List ancillary objects labeled for cleanup, across all scopes
    async fn list_ancillary(&self) -> Result<Vec<AncillaryRef>, OrchestratorError>;

    /// Delete one ancillary object; deleting a missing object succeeds
    async fn delete_ancillary(&self, scope: &str, name: &str) -> Result<(), OrchestratorError>;

    /// Start the upload unit for a job; an existing upload unit is left alone
    async fn submit_upload(&self, upload: &UploadSpec) -> Result<(), OrchestratorError>;

    /// Summaries of all cluster nodes
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, OrchestratorError>;
}
