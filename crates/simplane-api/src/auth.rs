//! Caller identification from request headers

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use simplane_common::{Error, Tenant};

use crate::error::ApiResult;
use crate::server::AppState;

/// Header carrying the administrative key
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Resolve the tenant behind the `Authorization` header
pub async fn tenant_from(state: &AppState, headers: &HeaderMap) -> ApiResult<Tenant> {
    let presented = header(headers, AUTHORIZATION.as_str())
        .ok_or_else(|| Error::unauthorized("missing Authorization header"))?;
    Ok(state.plane.tenants.authenticate(presented).await?)
}

/// Whether the request presents an admin key at all
pub fn has_admin_key(headers: &HeaderMap) -> bool {
    headers.contains_key(ADMIN_KEY_HEADER)
}

/// Require a valid administrative key
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    Ok(state
        .plane
        .tenants
        .authorize_admin(header(headers, ADMIN_KEY_HEADER))?)
}
