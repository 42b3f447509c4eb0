//! Job record and status state machine
//!
//! Status moves strictly forward: PENDING → RUNNING → {SUCCEEDED, FAILED}.
//! PENDING may also jump straight to a terminal status when a unit of work
//! finishes between two observations. Nothing leaves a terminal status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of a job
///
/// The wire form is exactly `PENDING`, `RUNNING`, `SUCCEEDED`, `FAILED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Admitted, unit of work not yet observed running
    Pending,
    /// At least one execution attempt observed active
    Running,
    /// Unit of work completed successfully
    Succeeded,
    /// Unit of work failed, exceeded its deadline, or vanished
    Failed,
}

impl JobStatus {
    /// Statuses that count against a tenant's concurrent-job limit
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Running];

    /// Statuses from which no transition is permitted
    pub const TERMINAL: [JobStatus; 2] = [JobStatus::Succeeded, JobStatus::Failed];

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether this status is SUCCEEDED or FAILED
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects monotonicity
    ///
    /// Self-transitions are not transitions and return false.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Result location
// =============================================================================

/// Where a job's output artifacts are kept
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Orchestrator-local persistent volume shared by the tenant
    Volume,
    /// Amazon S3
    S3,
    /// Google Cloud Storage
    Gcs,
    /// Azure Blob Storage
    Azure,
}

impl StorageKind {
    /// Lowercase name used in settings and persisted rows
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volume => "volume",
            Self::S3 => "s3",
            Self::Gcs => "gcs",
            Self::Azure => "azure",
        }
    }

    /// Whether results must be staged out of the volume
    pub fn is_object_store(&self) -> bool {
        !matches!(self, Self::Volume)
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "volume" | "pvc" => Ok(Self::Volume),
            "s3" => Ok(Self::S3),
            "gcs" => Ok(Self::Gcs),
            "azure" => Ok(Self::Azure),
            other => Err(format!("unknown storage kind '{other}'")),
        }
    }
}

/// Resolved location of a job's result artifacts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLocation {
    /// Backend holding the artifacts
    pub kind: StorageKind,
    /// Addressable location (e.g. `pvc://results-acme/<job>` or `s3://bucket/prefix/`)
    pub uri: String,
    /// Result file names relative to `uri`
    pub files: Vec<String>,
}

// =============================================================================
// Job
// =============================================================================

/// Durable record of one submitted simulation job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub job_id: Uuid,
    /// Owning tenant
    pub tenant_id: String,
    /// Name of the orchestrator unit of work
    pub unit_name: String,
    /// Isolated execution scope the unit runs in
    pub namespace: String,
    /// Current status
    pub status: JobStatus,
    /// Admission time
    pub submitted_at: DateTime<Utc>,
    /// First time the job was observed RUNNING (or reached terminal)
    pub started_at: Option<DateTime<Utc>>,
    /// First time a terminal status was observed
    pub finished_at: Option<DateTime<Utc>>,
    /// First time the orchestrator reported the unit exists
    pub observed_at: Option<DateTime<Utc>>,
    /// Opaque scenario metadata supplied at submission
    pub scenario: serde_json::Map<String, serde_json::Value>,
    /// Requested CPU cores
    pub cpu_request: u32,
    /// Requested memory in GiB
    pub memory_gi: u32,
    /// Human-readable note on the last status change (e.g. vanished unit)
    pub status_message: Option<String>,
    /// Result location once resolved
    pub result: Option<ResultLocation>,
}

/// Prefix of every unit-of-work name
pub const UNIT_NAME_PREFIX: &str = "sim-";

impl Job {
    /// Build a freshly admitted PENDING job
    pub fn new(
        tenant_id: impl Into<String>,
        namespace: impl Into<String>,
        cpu_request: u32,
        memory_gi: u32,
        scenario: serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let job_id = Uuid::new_v4();
        Self {
            job_id,
            tenant_id: tenant_id.into(),
            unit_name: unit_name_for(&job_id),
            namespace: namespace.into(),
            status: JobStatus::Pending,
            submitted_at: now,
            started_at: None,
            finished_at: None,
            observed_at: None,
            scenario,
            cpu_request,
            memory_gi,
            status_message: None,
            result: None,
        }
    }

    /// Whether the orchestrator has ever reported this job's unit
    ///
    /// A stored RUNNING status counts as evidence even without the marker.
    pub fn has_been_observed(&self) -> bool {
        self.observed_at.is_some() || self.status != JobStatus::Pending
    }
}

/// Deterministic, collision-resistant unit name for a job id
///
/// Uses the full 128-bit id so distinct jobs never share a unit name;
/// `sim-` + 32 hex chars stays within the 63-char DNS label limit.
pub fn unit_name_for(job_id: &Uuid) -> String {
    format!("{}{}", UNIT_NAME_PREFIX, job_id.simple())
}

// =============================================================================
// Status update
// =============================================================================

/// A single-row, compare-and-set status write
///
/// Applied only if the stored status still equals `expected`; timestamps are
/// written only where the stored value is still null.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    /// Status the writer observed before computing the update
    pub expected: JobStatus,
    /// Status to write
    pub status: JobStatus,
    /// Start timestamp, kept only if none is stored
    pub started_at: Option<DateTime<Utc>>,
    /// Finish timestamp, kept only if none is stored
    pub finished_at: Option<DateTime<Utc>>,
    /// First-seen marker, kept only if none is stored
    pub observed_at: Option<DateTime<Utc>>,
    /// Note attached to the change
    pub message: Option<String>,
}
