//! Tenant job endpoints

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use simplane_common::{Error, Job};
use simplane_controller::{Dashboard, JobResults, SubmitRequest};
use uuid::Uuid;

use crate::auth::tenant_from;
use crate::error::ApiResult;
use crate::server::AppState;

fn default_cpu() -> u32 {
    2
}

fn default_memory() -> u32 {
    4
}

/// Body of `POST /jobs`
#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    /// Scenario identifier
    pub scenario_id: String,
    /// CPU cores
    #[serde(default = "default_cpu")]
    pub cpu_request: u32,
    /// Memory in GiB
    #[serde(default = "default_memory")]
    pub memory_gi: u32,
    /// Base64-encoded ZIP archive
    #[serde(default)]
    pub payload: Option<String>,
    /// Extra scenario metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SubmitBody {
    fn into_request(self) -> Result<SubmitRequest, Error> {
        let payload = self
            .payload
            .map(|p| STANDARD.decode(p.trim()))
            .transpose()
            .map_err(|e| Error::payload(format!("payload is not valid base64: {e}")))?;
        Ok(SubmitRequest {
            scenario_id: self.scenario_id,
            cpu_request: self.cpu_request,
            memory_gi: self.memory_gi,
            payload,
            metadata: self.metadata,
        })
    }
}

/// Handle `POST /jobs`
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> ApiResult<impl IntoResponse> {
    let tenant = tenant_from(&state, &headers).await?;
    let job = state
        .plane
        .admission
        .submit(&tenant, body.into_request()?)
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Handle `GET /jobs/{job_id}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<Job>> {
    let tenant = tenant_from(&state, &headers).await?;
    Ok(Json(state.plane.admission.get_status(&tenant, job_id).await?))
}

/// Handle `GET /jobs/{job_id}/logs`
pub async fn get_logs(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let tenant = tenant_from(&state, &headers).await?;
    let logs = state.plane.admission.get_logs(&tenant, job_id).await?;
    Ok(Json(serde_json::json!({ "job_id": job_id, "logs": logs })))
}

/// Handle `GET /jobs/{job_id}/results`
pub async fn get_results(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<JobResults>> {
    let tenant = tenant_from(&state, &headers).await?;
    Ok(Json(state.plane.admission.get_results(&tenant, job_id).await?))
}

/// Handle `GET /tenants/me/dashboard`
pub async fn dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Dashboard>> {
    let tenant = tenant_from(&state, &headers).await?;
    Ok(Json(state.plane.admission.dashboard(&tenant).await?))
}
