//! Reconciler and cleanup sweep
//!
//! The job store holds one authoritative state machine per job. The only
//! thing that moves it after admission is [`observe`]: a pure function from
//! (stored job, orchestrator-reported unit state, now) to an optional
//! compare-and-set update. The loop here lists in-flight jobs, asks the
//! orchestrator about each, and applies whatever `observe` returns.
//!
//! Failures stay local. An orchestrator error for one job skips that job for
//! the cycle; an unreachable orchestrator ends the cycle early; a store write
//! failure is logged and the next job is processed. Nothing here returns an
//! error to a caller or panics the process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use simplane_common::config::ReconcilerSettings;
use simplane_common::{metrics, Job, JobStatus, StatusUpdate};
use simplane_orchestrator::{AncillaryRef, Orchestrator, UnitState};
use simplane_store::{JobFilter, JobStore, Store};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bounded;
use crate::resolver::{Resolution, ResultResolver};

/// Note recorded when a unit that was seen before is gone
pub const VANISHED_MESSAGE: &str = "unit of work vanished before completion";

/// Note recorded when a unit never showed up within the visibility grace
pub const NEVER_APPEARED_MESSAGE: &str = "unit of work never appeared";

/// Note recorded when the orchestrator reports the unit failed
pub const FAILED_MESSAGE: &str = "unit of work failed";

/// Outcome of one reconciliation cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// In-flight jobs examined
    pub examined: usize,
    /// Jobs whose status changed
    pub transitioned: usize,
    /// Result locations recorded
    pub resolved: usize,
    /// Per-job failures (orchestrator queries, store writes, resolution)
    pub errors: usize,
    /// Whether the cycle stopped early because the orchestrator or store was unreachable
    pub aborted: bool,
}

/// Outcome of one cleanup sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ancillary objects listed
    pub examined: usize,
    /// Ancillary objects deleted
    pub deleted: usize,
    /// Failed lookups or deletions
    pub errors: usize,
}

fn age_exceeds(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - since).to_std().map_or(false, |age| age > limit)
}

/// Start time recorded for a job that reached a terminal state without one
fn backfilled_start(job: &Job) -> DateTime<Utc> {
    job.observed_at.unwrap_or(job.submitted_at)
}

/// Map an observed unit state onto a job
///
/// Returns the compare-and-set write to apply, or `None` when nothing changed.
/// Terminal jobs never produce an update, and a status never moves backwards
/// (a RUNNING job whose unit briefly reports no active attempt stays RUNNING).
///
/// A missing unit fails the job only if it was seen before or the job is
/// older than `visibility_grace`; a unit that has simply not been created yet
/// keeps the job PENDING.
pub fn observe(
    job: &Job,
    state: UnitState,
    now: DateTime<Utc>,
    visibility_grace: Duration,
) -> Option<StatusUpdate> {
    if job.status.is_terminal() {
        return None;
    }

    if !state.exists {
        let message = if job.has_been_observed() {
            VANISHED_MESSAGE
        } else if age_exceeds(job.submitted_at, now, visibility_grace) {
            NEVER_APPEARED_MESSAGE
        } else {
            return None;
        };
        return Some(StatusUpdate {
            expected: job.status,
            status: JobStatus::Failed,
            started_at: job.started_at.is_none().then(|| backfilled_start(job)),
            finished_at: Some(now),
            observed_at: None,
            message: Some(message.to_string()),
        });
    }

    let observed_at = job.observed_at.is_none().then_some(now);
    let target = if state.succeeded > 0 {
        JobStatus::Succeeded
    } else if state.failed > 0 {
        JobStatus::Failed
    } else if state.active > 0 {
        JobStatus::Running
    } else {
        JobStatus::Pending
    };
    let status = if job.status.can_transition_to(target) {
        target
    } else {
        job.status
    };

    if status == job.status && observed_at.is_none() {
        return None;
    }

    let started_at = match status {
        JobStatus::Running if job.started_at.is_none() => Some(now),
        s if s.is_terminal() && job.started_at.is_none() => Some(job.observed_at.unwrap_or(now)),
        _ => None,
    };
    let finished_at = (status.is_terminal() && job.finished_at.is_none()).then_some(now);
    let message = (status == JobStatus::Failed).then(|| FAILED_MESSAGE.to_string());

    Some(StatusUpdate {
        expected: job.status,
        status,
        started_at,
        finished_at,
        observed_at,
        message,
    })
}

/// Local copy of a job after `update` was applied by the store
fn applied(job: &Job, update: &StatusUpdate) -> Job {
    let mut next = job.clone();
    next.status = update.status;
    next.started_at = next.started_at.or(update.started_at);
    next.finished_at = next.finished_at.or(update.finished_at);
    next.observed_at = next.observed_at.or(update.observed_at);
    if update.message.is_some() {
        next.status_message = update.message.clone();
    }
    next
}

/// Periodic reconciliation of job records against the orchestrator
pub struct Reconciler {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    resolver: Arc<ResultResolver>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        resolver: Arc<ResultResolver>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            orchestrator,
            resolver,
            settings,
        }
    }

    /// Run one reconciliation cycle
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();
        let mut attempted = HashSet::new();

        let jobs = match self
            .store
            .list_jobs(&JobFilter::in_flight(self.settings.batch_size))
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to list in-flight jobs, skipping cycle");
                report.errors += 1;
                report.aborted = true;
                metrics::record_cycle(started.elapsed(), true);
                return report;
            }
        };

        for job in &jobs {
            report.examined += 1;
            let state = match bounded(
                "unit_state",
                self.settings.call_timeout,
                self.orchestrator.unit_state(&job.namespace, &job.unit_name),
            )
            .await
            {
                Ok(state) => state,
                Err(e) if e.is_unavailable() => {
                    warn!(error = %e, "orchestrator unavailable, ending cycle early");
                    report.errors += 1;
                    report.aborted = true;
                    break;
                }
                Err(e) => {
                    warn!(job_id = %job.job_id, unit = %job.unit_name, error = %e, "failed to read unit state");
                    report.errors += 1;
                    continue;
                }
            };

            let Some(update) = observe(job, state, Utc::now(), self.settings.visibility_grace)
            else {
                continue;
            };

            match self.store.update_job_status(job.job_id, &update).await {
                Ok(true) => {
                    if update.status == job.status {
                        debug!(job_id = %job.job_id, "first sighting of unit recorded");
                        continue;
                    }
                    report.transitioned += 1;
                    metrics::record_transition(update.status);
                    info!(
                        job_id = %job.job_id,
                        tenant = %job.tenant_id,
                        from = %job.status,
                        to = %update.status,
                        note = update.message.as_deref().unwrap_or(""),
                        "job status changed"
                    );
                    if update.status.is_terminal() {
                        attempted.insert(job.job_id);
                        self.resolve(&applied(job, &update), &mut report).await;
                    }
                }
                Ok(false) => {
                    debug!(job_id = %job.job_id, "job changed concurrently, skipping");
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "failed to write job status");
                    report.errors += 1;
                }
            }
        }

        if !report.aborted {
            self.backfill(&attempted, &mut report).await;
        }

        let elapsed = started.elapsed();
        metrics::record_cycle(elapsed, report.aborted);
        info!(
            examined = report.examined,
            transitioned = report.transitioned,
            resolved = report.resolved,
            errors = report.errors,
            aborted = report.aborted,
            elapsed_ms = elapsed.as_millis() as u64,
            "reconciliation cycle finished"
        );
        report
    }

    async fn resolve(&self, job: &Job, report: &mut CycleReport) {
        match self.resolver.resolve_and_record(job).await {
            Ok(Resolution::Resolved(_)) => report.resolved += 1,
            Ok(Resolution::Pending) => {
                debug!(job_id = %job.job_id, "results not observable yet");
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "result resolution failed, will retry");
                report.errors += 1;
            }
        }
    }

    /// Fill in missing start times and result locations of terminal jobs
    async fn backfill(&self, skip: &HashSet<Uuid>, report: &mut CycleReport) {
        let jobs = match self
            .store
            .list_jobs(&JobFilter::unresolved(self.settings.batch_size))
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to list unresolved jobs");
                report.errors += 1;
                return;
            }
        };

        for job in jobs.iter().filter(|j| !skip.contains(&j.job_id)) {
            let mut job = job.clone();
            if job.started_at.is_none() {
                let update = StatusUpdate {
                    expected: job.status,
                    status: job.status,
                    started_at: Some(backfilled_start(&job)),
                    finished_at: None,
                    observed_at: None,
                    message: None,
                };
                match self.store.update_job_status(job.job_id, &update).await {
                    Ok(_) => job = applied(&job, &update),
                    Err(e) => {
                        warn!(job_id = %job.job_id, error = %e, "failed to backfill start time");
                        report.errors += 1;
                    }
                }
            }
            self.resolve(&job, report).await;
        }
    }

    fn sweepable(&self, object: &AncillaryRef, now: DateTime<Utc>) -> bool {
        object
            .created_at
            .map_or(true, |t| age_exceeds(t, now, self.settings.ancillary_grace))
    }

    /// Delete ancillary payload objects whose job is finished or unknown
    ///
    /// Objects younger than the grace period are kept regardless of their job.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let objects = match bounded(
            "list_ancillary",
            self.settings.call_timeout,
            self.orchestrator.list_ancillary(),
        )
        .await
        {
            Ok(objects) => objects,
            Err(e) => {
                warn!(error = %e, "failed to list ancillary objects, skipping sweep");
                report.errors += 1;
                return report;
            }
        };

        for object in objects {
            report.examined += 1;
            if !self.sweepable(&object, now) {
                continue;
            }

            let owner_finished = match object.job_id {
                None => true,
                Some(job_id) => match self.store.get_job(job_id).await {
                    Ok(Some(job)) => job.status.is_terminal(),
                    Ok(None) => true,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "failed to look up ancillary owner");
                        report.errors += 1;
                        continue;
                    }
                },
            };
            if !owner_finished {
                continue;
            }

            match bounded(
                "delete_ancillary",
                self.settings.call_timeout,
                self.orchestrator
                    .delete_ancillary(&object.scope, &object.name),
            )
            .await
            {
                Ok(()) => {
                    debug!(scope = %object.scope, name = %object.name, "ancillary object deleted");
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(scope = %object.scope, name = %object.name, error = %e, "failed to delete ancillary object");
                    report.errors += 1;
                }
            }
        }

        metrics::record_sweep_deletions(report.deleted as u64);
        info!(
            examined = report.examined,
            deleted = report.deleted,
            errors = report.errors,
            "cleanup sweep finished"
        );
        report
    }

    /// Run reconciliation cycles until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.settings.interval.as_secs(), "reconciler started");
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        info!("reconciler stopped");
    }

    /// Run cleanup sweeps until `cancel` fires
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.settings.sweep_interval.as_secs(), "cleanup sweeper started");
        let mut interval = tokio::time::interval(self.settings.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("cleanup sweeper stopped");
    }
}
