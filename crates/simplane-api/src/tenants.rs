//! Tenant registration and administration endpoints

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simplane_common::{Error, LimitsPatch, Tenant, TenantLimits};
use tracing::warn;

use crate::auth::{has_admin_key, require_admin, tenant_from};
use crate::error::ApiResult;
use crate::server::AppState;

/// Tenant as shown to clients; the credential digest never leaves the store
#[derive(Debug, Serialize, Deserialize)]
pub struct TenantView {
    /// Tenant identifier
    pub tenant_id: String,
    /// Execution scope
    pub namespace: String,
    /// Quota limits
    #[serde(flatten)]
    pub limits: TenantLimits,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl From<Tenant> for TenantView {
    fn from(t: Tenant) -> Self {
        Self {
            tenant_id: t.tenant_id,
            namespace: t.namespace,
            limits: t.limits,
            created_at: t.created_at,
        }
    }
}

/// Body of `POST /auth/register`
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Desired tenant identifier
    pub tenant_id: String,
    /// Limits; unset fields take the defaults
    #[serde(flatten)]
    pub limits: LimitsPatch,
}

/// Response carrying a plaintext credential, shown once
#[derive(Debug, Serialize)]
pub struct CredentialResponse {
    /// Tenant the credential belongs to
    #[serde(flatten)]
    pub tenant: TenantView,
    /// Plaintext API key
    pub api_key: String,
}

/// Body of `POST /auth/regenerate-key`
#[derive(Debug, Default, Deserialize)]
pub struct RegenerateRequest {
    /// Target tenant, for administrative rotation
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Handle `POST /auth/register`
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let registration = state
        .plane
        .tenants
        .register(&request.tenant_id, &request.limits)
        .await?;

    // The scope is applied again on every submission, so a failure here is not fatal
    if let Err(e) = state
        .plane
        .admission
        .provision_scope(&registration.tenant)
        .await
    {
        warn!(tenant = %registration.tenant.tenant_id, error = %e, "scope not provisioned at registration");
    }

    Ok((
        StatusCode::CREATED,
        Json(CredentialResponse {
            api_key: registration.credential.as_str().to_string(),
            tenant: registration.tenant.into(),
        }),
    ))
}

/// Handle `POST /auth/regenerate-key`
///
/// A tenant rotates its own key with its current credential. With the admin
/// key, any tenant named in the body is rotated.
pub async fn regenerate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RegenerateRequest>>,
) -> ApiResult<Json<CredentialResponse>> {
    let tenant = if has_admin_key(&headers) {
        require_admin(&state, &headers)?;
        let tenant_id = body
            .and_then(|Json(b)| b.tenant_id)
            .ok_or_else(|| Error::validation_field("tenant_id", "tenant_id is required"))?;
        state.plane.tenants.get(&tenant_id).await?
    } else {
        tenant_from(&state, &headers).await?
    };

    let credential = state
        .plane
        .tenants
        .regenerate_credential(&tenant.tenant_id)
        .await?;
    Ok(Json(CredentialResponse {
        api_key: credential.as_str().to_string(),
        tenant: tenant.into(),
    }))
}

/// Handle `GET /auth/tenants`
pub async fn list_tenants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let tenants: Vec<TenantView> = state
        .plane
        .tenants
        .list()
        .await?
        .into_iter()
        .map(TenantView::from)
        .collect();
    Ok(Json(serde_json::json!({ "tenants": tenants })))
}

/// Handle `GET /auth/tenants/{tenant_id}`
pub async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<TenantView>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.plane.tenants.get(&tenant_id).await?.into()))
}

/// Handle `PATCH /auth/tenants/{tenant_id}`
pub async fn update_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<LimitsPatch>,
) -> ApiResult<Json<TenantView>> {
    require_admin(&state, &headers)?;
    let tenant = state.plane.tenants.update_limits(&tenant_id, &patch).await?;
    if let Err(e) = state.plane.admission.provision_scope(&tenant).await {
        warn!(tenant = %tenant_id, error = %e, "new ceilings not applied to scope yet");
    }
    Ok(Json(tenant.into()))
}
