//! Request-level tests of the router over the in-memory store and fake orchestrator

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use simplane_api::auth::ADMIN_KEY_HEADER;
use simplane_api::router;
use simplane_controller::{ControlPlane, ControlPlaneSettings};
use simplane_orchestrator::FakeOrchestrator;
use simplane_store::MemoryStore;
use tower::ServiceExt;

const ADMIN_KEY: &str = "ops-key";

fn app() -> (Router, Arc<FakeOrchestrator>) {
    let fake = Arc::new(FakeOrchestrator::new());
    let settings = ControlPlaneSettings {
        admin_key: Some(ADMIN_KEY.to_string()),
        ..Default::default()
    };
    let max_payload = settings.admission.max_payload_bytes;
    let plane = ControlPlane::new(Arc::new(MemoryStore::new()), fake.clone(), settings);
    (router(plane, max_payload), fake)
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register(app: &Router, tenant_id: &str, max_concurrent_jobs: u32) -> String {
    let (status, body) = call(
        app,
        Method::POST,
        "/auth/register",
        &[],
        Some(json!({ "tenant_id": tenant_id, "max_concurrent_jobs": max_concurrent_jobs })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    format!("Bearer {}", body["api_key"].as_str().unwrap())
}

#[tokio::test]
async fn test_health_and_ready() {
    let (app, _) = app();
    let (status, body) = call(&app, Method::GET, "/health", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = call(&app, Method::GET, "/ready", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_register_returns_key_once_and_provisions_scope() {
    let (app, fake) = app();
    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/register",
        &[],
        Some(json!({ "tenant_id": "acme", "max_cpu": 8 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["api_key"].as_str().unwrap().starts_with("sk-"));
    assert_eq!(body["namespace"], "acme");
    assert_eq!(body["max_cpu"], 8);
    assert!(body.get("credential_hash").is_none());
    assert_eq!(fake.scope("acme").unwrap().cpu_limit, 8);

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/register",
        &[],
        Some(json!({ "tenant_id": "acme" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

/// Story: the quota scenario over HTTP, with the rejection mapped to 429
#[tokio::test]
async fn story_submission_statuses() {
    let (app, _) = app();
    let key = register(&app, "acme", 1).await;
    let auth = [("authorization", key.as_str())];

    let (status, job) = call(
        &app,
        Method::POST,
        "/jobs",
        &auth,
        Some(json!({ "scenario_id": "grid" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["status"], "PENDING");
    assert_eq!(job["cpu_request"], 2);

    let (status, body) = call(
        &app,
        Method::POST,
        "/jobs",
        &auth,
        Some(json!({ "scenario_id": "grid-2" })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
    assert_eq!(body["code"], 429);

    let uri = format!("/jobs/{}", job["job_id"].as_str().unwrap());
    let (status, fetched) = call(&app, Method::GET, &uri, &auth, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["job_id"], job["job_id"]);

    let (status, results) = call(&app, Method::GET, &format!("{uri}/results"), &auth, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results["status"], "PENDING");
    assert!(results["result"].is_null());

    let (status, dashboard) = call(&app, Method::GET, "/tenants/me/dashboard", &auth, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dashboard["active_jobs"], 1);
}

#[tokio::test]
async fn test_rejections_map_to_client_errors() {
    let (app, _) = app();
    let key = register(&app, "acme", 2).await;
    let auth = [("authorization", key.as_str())];

    let (status, body) = call(
        &app,
        Method::POST,
        "/jobs",
        &auth,
        Some(json!({ "scenario_id": "grid", "cpu_request": 64 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");

    let (status, body) = call(
        &app,
        Method::POST,
        "/jobs",
        &auth,
        Some(json!({ "scenario_id": "grid", "payload": "%%%" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "payload");

    let (status, body) = call(
        &app,
        Method::POST,
        "/jobs",
        &[],
        Some(json!({ "scenario_id": "grid" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = call(
        &app,
        Method::GET,
        "/tenants/me/dashboard",
        &[("authorization", "Bearer sk-wrong")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_jobs_are_private_to_their_tenant() {
    let (app, _) = app();
    let acme = register(&app, "acme", 2).await;
    let globex = register(&app, "globex", 2).await;

    let (_, job) = call(
        &app,
        Method::POST,
        "/jobs",
        &[("authorization", acme.as_str())],
        Some(json!({ "scenario_id": "grid" })),
    )
    .await;
    let uri = format!("/jobs/{}", job["job_id"].as_str().unwrap());

    let (status, body) = call(&app, Method::GET, &uri, &[("authorization", globex.as_str())], None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn test_regenerated_key_replaces_the_old_one() {
    let (app, _) = app();
    let old = register(&app, "acme", 2).await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/regenerate-key",
        &[("authorization", old.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new = format!("Bearer {}", body["api_key"].as_str().unwrap());
    assert_ne!(new, old);

    let (status, _) = call(&app, Method::GET, "/tenants/me/dashboard", &[("authorization", old.as_str())], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = call(&app, Method::GET, "/tenants/me/dashboard", &[("authorization", new.as_str())], None).await;
    assert_eq!(status, StatusCode::OK);

    // Operators can rotate any tenant's key
    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/regenerate-key",
        &[(ADMIN_KEY_HEADER, ADMIN_KEY)],
        Some(json!({ "tenant_id": "acme" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenant_id"], "acme");
}

/// Story: administrative routes need the admin key, and limit updates reach
/// the tenant's scope
#[tokio::test]
async fn story_admin_routes() {
    let (app, fake) = app();
    register(&app, "acme", 2).await;

    let (status, _) = call(&app, Method::GET, "/auth/tenants", &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = call(&app, Method::GET, "/auth/tenants", &[(ADMIN_KEY_HEADER, "nope")], None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = [(ADMIN_KEY_HEADER, ADMIN_KEY)];
    let (status, body) = call(&app, Method::GET, "/auth/tenants", &admin, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenants"].as_array().unwrap().len(), 1);

    let (status, body) = call(
        &app,
        Method::PATCH,
        "/auth/tenants/acme",
        &admin,
        Some(json!({ "max_cpu": 40 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_cpu"], 40);
    assert_eq!(fake.scope("acme").unwrap().cpu_limit, 40);

    let (status, body) = call(&app, Method::PATCH, "/auth/tenants/acme", &admin, Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");

    let (status, _) = call(&app, Method::GET, "/auth/tenants/ghost", &admin, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, Method::GET, "/admin/activity", &admin, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenants"], 1);

    let (status, body) = call(&app, Method::GET, "/admin/jobs?status=running", &admin, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);

    let (status, _) = call(&app, Method::GET, "/admin/jobs?status=bogus", &admin, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, Method::GET, "/admin/cluster", &admin, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_nodes"], 0);

    fake.set_unavailable(true);
    let (status, body) = call(&app, Method::GET, "/admin/cluster", &admin, None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "orchestrator");
}
