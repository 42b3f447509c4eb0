//! End-to-end admission and reconciliation scenarios against the in-memory
//! store and the scripted orchestrator

mod common;

use std::sync::Arc;

use common::{archive, harness, request};
use simplane_common::{Error, JobStatus, LimitsPatch, StorageKind};
use simplane_controller::SubmitRequest;
use simplane_orchestrator::UnitState;
use simplane_store::{JobFilter, JobStore};

/// Story: with a limit of one, the second submission waits for the first
/// to finish
#[tokio::test]
async fn story_quota_frees_after_completion() {
    let h = harness();
    let tenant = h.tenant("acme", 1).await;

    let a = h.plane.admission.submit(&tenant, request("a")).await.unwrap();
    assert_eq!(a.status, JobStatus::Pending);

    let err = h.plane.admission.submit(&tenant, request("b")).await.unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { active: 1, limit: 1, .. }));

    h.fake
        .set_unit_state(&a.namespace, &a.unit_name, UnitState::succeeded());
    let report = h.plane.reconciler.run_cycle().await;
    assert_eq!(report.transitioned, 1);
    assert_eq!(
        h.store.get_job(a.job_id).await.unwrap().unwrap().status,
        JobStatus::Succeeded
    );

    let b = h.plane.admission.submit(&tenant, request("b")).await.unwrap();
    assert_eq!(b.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_cpu_above_global_ceiling_creates_no_job() {
    let h = harness();
    let tenant = h.tenant("acme", 2).await;
    // Raise the tenant above the per-job ceiling so only the global bound applies
    h.plane
        .tenants
        .update_limits(
            "acme",
            &LimitsPatch {
                max_cpu: Some(64),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let tenant = h.plane.tenants.get(&tenant.tenant_id).await.unwrap();

    let err = h
        .plane
        .admission
        .submit(
            &tenant,
            SubmitRequest {
                cpu_request: 33,
                ..request("big")
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert!(h.plane.admin.list_jobs(None, 10).await.unwrap().is_empty());
    assert_eq!(h.fake.calls("ensure_scope"), 0);
}

#[tokio::test]
async fn test_payload_without_required_file_never_reaches_orchestrator() {
    let h = harness();
    let tenant = h.tenant("acme", 2).await;

    let err = h
        .plane
        .admission
        .submit(
            &tenant,
            SubmitRequest {
                payload: Some(archive(&[("routes.rou.xml", "<routes/>")])),
                ..request("grid")
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Payload { .. }));
    assert!(err.to_string().contains(".sumocfg"));
    assert_eq!(h.fake.calls("ensure_scope"), 0);
    assert_eq!(h.fake.calls("submit_unit"), 0);
    assert!(h.plane.admin.list_jobs(None, 10).await.unwrap().is_empty());
}

/// Story: a finished job's results are resolved once; later cycles leave
/// them alone
#[tokio::test]
async fn story_results_resolve_exactly_once() {
    let h = harness();
    let tenant = h.tenant("acme", 2).await;
    let job = h.plane.admission.submit(&tenant, request("grid")).await.unwrap();

    h.fake
        .set_unit_state(&job.namespace, &job.unit_name, UnitState::active());
    let first = h.plane.reconciler.run_cycle().await;
    assert_eq!(first.transitioned, 1);
    assert_eq!(first.resolved, 0);

    h.fake
        .set_unit_state(&job.namespace, &job.unit_name, UnitState::succeeded());
    h.fake.set_output(
        &job.namespace,
        &job.unit_name,
        "Simulation ended\nsimplane-result-file: tripinfo.xml\nsimplane-result-file: summary.xml\n",
    );
    let second = h.plane.reconciler.run_cycle().await;
    assert_eq!(second.transitioned, 1);
    assert_eq!(second.resolved, 1);

    let stored = h.store.get_job(job.job_id).await.unwrap().unwrap();
    let location = stored.result.clone().expect("result location");
    assert_eq!(location.kind, StorageKind::Volume);
    assert!(!location.uri.is_empty());
    assert_eq!(location.files, vec!["tripinfo.xml", "summary.xml"]);
    assert!(stored.started_at.is_some());
    assert!(stored.finished_at.is_some());

    let reads = h.fake.calls("read_recent_output");
    let third = h.plane.reconciler.run_cycle().await;
    assert_eq!(third.resolved, 0);
    assert_eq!(third.examined, 0);
    assert_eq!(h.fake.calls("read_recent_output"), reads);
    assert_eq!(
        h.store.get_job(job.job_id).await.unwrap().unwrap().result,
        Some(location)
    );

    let results = h
        .plane
        .admission
        .get_results(&tenant, job.job_id)
        .await
        .unwrap();
    assert_eq!(results.status, JobStatus::Succeeded);
    assert_eq!(results.result.unwrap().files.len(), 2);
}

/// K+M simultaneous submissions admit exactly K
#[tokio::test]
async fn test_concurrent_submissions_admit_exactly_the_limit() {
    const K: u32 = 3;
    const M: usize = 7;

    let h = harness();
    let tenant = Arc::new(h.tenant("acme", K).await);
    let admission = h.plane.admission.clone();

    let handles: Vec<_> = (0..K as usize + M)
        .map(|i| {
            let admission = admission.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move { admission.submit(&tenant, request(&format!("s{i}"))).await })
        })
        .collect();

    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(Error::QuotaExceeded { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, K as usize);
    assert_eq!(rejected, M);
    assert_eq!(
        h.store
            .list_jobs(&JobFilter::in_flight(100))
            .await
            .unwrap()
            .len(),
        K as usize
    );
    assert_eq!(h.fake.submitted().len(), K as usize);
}

/// Story: re-submitting reuses the scope and refreshes its ceilings to the
/// tenant's latest limits
#[tokio::test]
async fn story_scope_is_reused_and_refreshed() {
    let h = harness();
    let tenant = h.tenant("acme", 5).await;

    h.plane.admission.submit(&tenant, request("one")).await.unwrap();
    h.plane.admission.submit(&tenant, request("two")).await.unwrap();
    assert_eq!(h.fake.scope_count(), 1);
    assert_eq!(h.fake.scope_applies("acme"), 2);
    assert_eq!(h.fake.scope("acme").unwrap().cpu_limit, 10);

    h.plane
        .tenants
        .update_limits(
            "acme",
            &LimitsPatch {
                max_cpu: Some(40),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let tenant = h.plane.tenants.get("acme").await.unwrap();
    h.plane.admission.submit(&tenant, request("three")).await.unwrap();

    assert_eq!(h.fake.scope_count(), 1);
    let scope = h.fake.scope("acme").unwrap();
    assert_eq!(scope.cpu_limit, 40);
    assert_eq!(scope.pod_cap, 5);
}

#[tokio::test]
async fn test_payload_is_delivered_and_recorded() {
    let h = harness();
    let tenant = h.tenant("acme", 2).await;

    let job = h
        .plane
        .admission
        .submit(
            &tenant,
            SubmitRequest {
                payload: Some(archive(&[
                    ("grid.net.xml", "<net/>"),
                    ("scenario/grid.sumocfg", "<configuration/>"),
                    ("scenario/alt.sumocfg", "<configuration/>"),
                ])),
                ..request("grid")
            },
        )
        .await
        .unwrap();

    assert_eq!(job.scenario["config_file"], "scenario/grid.sumocfg");
    assert_eq!(job.scenario["scenario_id"], "grid");
    let submitted = h.fake.submitted();
    assert!(submitted[0].payload.is_some());
    // The unit runs exactly the file admission validated
    assert_eq!(
        submitted[0].config_file.as_deref(),
        Some("scenario/grid.sumocfg")
    );
    assert_eq!(h.fake.ancillary().len(), 1);
}

/// Story: a submission without a payload runs the scenario bundled in the
/// image, located by the configured suffix; caller metadata cannot name a
/// config file for it
#[tokio::test]
async fn story_submission_without_payload_runs_bundled_scenario() {
    let mut settings = common::settings();
    settings.admission.required_suffix = ".netcfg".to_string();
    settings.admission.bundled_scenarios_dir = "/opt/scenarios".to_string();
    let h = common::harness_with(settings);
    let tenant = h.tenant("acme", 2).await;

    let mut metadata = serde_json::Map::new();
    metadata.insert("config_file".to_string(), "../../etc/passwd".into());
    metadata.insert("city".to_string(), "lyon".into());
    let job = h
        .plane
        .admission
        .submit(
            &tenant,
            SubmitRequest {
                metadata,
                ..request("lyon-peak")
            },
        )
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.scenario.get("config_file").is_none());
    assert_eq!(job.scenario["city"], "lyon");

    let submitted = h.fake.submitted();
    assert_eq!(submitted.len(), 1);
    assert!(submitted[0].payload.is_none());
    assert_eq!(submitted[0].config_file, None);
    assert_eq!(submitted[0].config_suffix, ".netcfg");
    assert_eq!(submitted[0].scenarios_dir, "/opt/scenarios");
    assert_eq!(submitted[0].env["SCENARIO_ID"], "lyon-peak");
    assert!(h.fake.ancillary().is_empty());
}

/// Story: a submission the orchestrator cannot accept is recorded as FAILED
/// and the error reaches the caller
#[tokio::test]
async fn story_submission_failure_is_recorded() {
    let h = harness();
    let tenant = h.tenant("acme", 1).await;
    h.fake.fail_submissions(true);

    let err = h.plane.admission.submit(&tenant, request("x")).await.unwrap_err();
    assert!(matches!(err, Error::Orchestrator { .. }));

    let jobs = h.plane.admin.list_jobs(None, 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);

    // The FAILED row is terminal, so the slot is free again
    h.fake.fail_submissions(false);
    h.plane.admission.submit(&tenant, request("y")).await.unwrap();
}

#[tokio::test]
async fn test_other_tenants_cannot_read_a_job() {
    let h = harness();
    let acme = h.tenant("acme", 2).await;
    let globex = h.tenant("globex", 2).await;
    let job = h.plane.admission.submit(&acme, request("x")).await.unwrap();

    assert!(matches!(
        h.plane.admission.get_status(&globex, job.job_id).await,
        Err(Error::Forbidden { .. })
    ));
    assert!(matches!(
        h.plane.admission.get_logs(&globex, job.job_id).await,
        Err(Error::Forbidden { .. })
    ));
    assert!(matches!(
        h.plane.admission.get_status(&acme, uuid::Uuid::new_v4()).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_logs_come_from_the_unit_and_vanish_with_it() {
    let h = harness();
    let tenant = h.tenant("acme", 2).await;
    let job = h.plane.admission.submit(&tenant, request("x")).await.unwrap();

    h.fake
        .set_output(&job.namespace, &job.unit_name, "step 100\nstep 200");
    assert_eq!(
        h.plane.admission.get_logs(&tenant, job.job_id).await.unwrap(),
        "step 100\nstep 200"
    );

    h.fake.remove_unit(&job.namespace, &job.unit_name);
    assert!(matches!(
        h.plane.admission.get_logs(&tenant, job.job_id).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_dashboard_and_unfinished_results() {
    let h = harness();
    let tenant = h.tenant("acme", 3).await;
    let job = h.plane.admission.submit(&tenant, request("x")).await.unwrap();
    h.plane.admission.submit(&tenant, request("y")).await.unwrap();

    let results = h
        .plane
        .admission
        .get_results(&tenant, job.job_id)
        .await
        .unwrap();
    assert_eq!(results.status, JobStatus::Pending);
    assert!(results.result.is_none());

    let dashboard = h.plane.admission.dashboard(&tenant).await.unwrap();
    assert_eq!(dashboard.active_jobs, 2);
    assert_eq!(dashboard.recent.len(), 2);
    assert_eq!(dashboard.limits.max_concurrent_jobs, 3);
}
