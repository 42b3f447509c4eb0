//! Administrative endpoints

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use simplane_common::{Error, JobStatus};
use simplane_controller::Activity;

use crate::auth::require_admin;
use crate::error::ApiResult;
use crate::server::AppState;

/// Default page size of `GET /admin/jobs`
const DEFAULT_JOB_PAGE: u32 = 100;

/// Query parameters of `GET /admin/jobs`
#[derive(Debug, Default, Deserialize)]
pub struct JobQuery {
    /// Only jobs in this status
    #[serde(default)]
    pub status: Option<String>,
    /// Page size
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Handle `GET /admin/cluster`
pub async fn cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let nodes = state.plane.admin.cluster_nodes().await?;
    let ready = nodes.iter().filter(|n| n.ready).count();
    Ok(Json(serde_json::json!({
        "nodes": nodes,
        "total_nodes": nodes.len(),
        "ready_nodes": ready,
    })))
}

/// Handle `GET /admin/jobs`
pub async fn jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<JobQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let status = query
        .status
        .as_deref()
        .map(|s| s.to_uppercase().parse::<JobStatus>())
        .transpose()
        .map_err(|e| Error::validation_field("status", e.to_string()))?;

    let jobs = state
        .plane
        .admin
        .list_jobs(status, query.limit.unwrap_or(DEFAULT_JOB_PAGE))
        .await?;
    Ok(Json(serde_json::json!({ "count": jobs.len(), "jobs": jobs })))
}

/// Handle `GET /admin/activity`
pub async fn activity(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Activity>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.plane.admin.activity().await?))
}
