//! Metrics for admission, reconciliation and cleanup
//!
//! Instruments are created lazily from the global meter, so they are no-ops
//! until a meter provider is installed by [`crate::telemetry::init_telemetry`].

use std::time::Duration;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::job::JobStatus;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("simplane"));

/// Counter of admission decisions
///
/// Labels:
/// - `outcome`: admitted, quota_exceeded, rejected, orchestrator_failed
pub static ADMISSIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("simplane_admissions_total")
        .with_description("Total number of job admission decisions")
        .with_unit("{admissions}")
        .build()
});

/// Histogram of reconciliation cycle duration
///
/// Labels:
/// - `result`: success, aborted
pub static CYCLE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("simplane_reconcile_cycle_duration_seconds")
        .with_description("Duration of reconciliation cycles in seconds")
        .with_unit("s")
        .build()
});

/// Counter of job status transitions written by the reconciler
///
/// Labels:
/// - `status`: RUNNING, SUCCEEDED, FAILED
pub static TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("simplane_job_transitions_total")
        .with_description("Total number of job status transitions")
        .with_unit("{transitions}")
        .build()
});

/// Counter of result location resolutions
///
/// Labels:
/// - `outcome`: resolved, pending, error
pub static RESOLUTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("simplane_result_resolutions_total")
        .with_description("Total number of result location resolution attempts")
        .with_unit("{resolutions}")
        .build()
});

/// Counter of ancillary objects deleted by the cleanup sweep
pub static SWEEP_DELETIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("simplane_sweep_deletions_total")
        .with_description("Total number of ancillary objects deleted by the sweep")
        .with_unit("{objects}")
        .build()
});

/// Outcome label for an admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Row inserted and unit submitted
    Admitted,
    /// Rejected at the concurrency ceiling
    QuotaExceeded,
    /// Rejected by validation or payload checks
    Rejected,
    /// Admitted, then failed at the orchestrator
    OrchestratorFailed,
}

impl AdmissionOutcome {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Rejected => "rejected",
            Self::OrchestratorFailed => "orchestrator_failed",
        }
    }
}

/// Record an admission decision
pub fn record_admission(outcome: AdmissionOutcome) {
    ADMISSIONS.add(1, &[KeyValue::new("outcome", outcome.as_str())]);
}

/// Record a completed reconciliation cycle
pub fn record_cycle(duration: Duration, aborted: bool) {
    let result = if aborted { "aborted" } else { "success" };
    CYCLE_DURATION.record(duration.as_secs_f64(), &[KeyValue::new("result", result)]);
}

/// Record a status transition
pub fn record_transition(status: JobStatus) {
    TRANSITIONS.add(1, &[KeyValue::new("status", status.as_str())]);
}

/// Record a resolver attempt
pub fn record_resolution(outcome: &'static str) {
    RESOLUTIONS.add(1, &[KeyValue::new("outcome", outcome)]);
}

/// Record sweep deletions
pub fn record_sweep_deletions(count: u64) {
    if count > 0 {
        SWEEP_DELETIONS.add(count, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(AdmissionOutcome::Admitted.as_str(), "admitted");
        assert_eq!(AdmissionOutcome::QuotaExceeded.as_str(), "quota_exceeded");
    }

    #[test]
    fn test_recording_without_provider_is_noop() {
        record_admission(AdmissionOutcome::Admitted);
        record_cycle(Duration::from_millis(5), false);
        record_transition(JobStatus::Succeeded);
        record_resolution("resolved");
        record_sweep_deletions(0);
    }
}
