//! Mapping of control-plane errors onto HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use simplane_common::Error;
use tracing::error;

/// Result type for handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// A control-plane error on its way to the client
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

/// HTTP status for an error kind
pub fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::Validation { .. } => StatusCode::BAD_REQUEST,
        Error::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        Error::Forbidden { .. } => StatusCode::FORBIDDEN,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Conflict { .. } => StatusCode::CONFLICT,
        Error::Payload {
            too_large: true, ..
        } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::Payload { .. } => StatusCode::BAD_REQUEST,
        Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::Orchestrator { .. } => StatusCode::BAD_GATEWAY,
        Error::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(kind = self.0.kind(), context = self.0.context().unwrap_or(""), error = %self.0, "request failed");
        }

        let body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
            "code": status.as_u16(),
        });
        (status, axum::Json(body)).into_response()
    }
}
