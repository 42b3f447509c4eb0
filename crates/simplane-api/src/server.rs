//! Router, shared state and the serving loop

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use simplane_controller::ControlPlane;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{admin, jobs, tenants};

/// Room for JSON framing around a base64 payload
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Control-plane services
    pub plane: ControlPlane,
}

/// Largest request body that can carry a payload of `max_payload_bytes`
pub fn body_limit(max_payload_bytes: usize) -> usize {
    max_payload_bytes.div_ceil(3) * 4 + BODY_OVERHEAD_BYTES
}

/// Build the HTTP router
pub fn router(plane: ControlPlane, max_payload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/auth/register", post(tenants::register))
        .route("/auth/regenerate-key", post(tenants::regenerate_key))
        .route("/auth/tenants", get(tenants::list_tenants))
        .route(
            "/auth/tenants/{tenant_id}",
            get(tenants::get_tenant).patch(tenants::update_tenant),
        )
        .route("/jobs", post(jobs::submit_job))
        .route("/jobs/{job_id}", get(jobs::get_job))
        .route("/jobs/{job_id}/logs", get(jobs::get_logs))
        .route("/jobs/{job_id}/results", get(jobs::get_results))
        .route("/tenants/me/dashboard", get(jobs::dashboard))
        .route("/admin/cluster", get(admin::cluster))
        .route("/admin/jobs", get(admin::jobs))
        .route("/admin/activity", get(admin::activity))
        .layer(DefaultBodyLimit::max(body_limit(max_payload_bytes)))
        .with_state(AppState { plane })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
    }))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match state.plane.ready().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))),
        Err(e) => {
            warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "not_ready", "reason": e.to_string() })),
            )
        }
    }
}

/// Serve `app` on `listener` until `shutdown` fires, then drain in-flight requests
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "serving HTTP");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
