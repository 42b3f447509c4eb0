//! HTTP surface of the simplane control plane
//!
//! Thin handlers over [`simplane_controller::ControlPlane`]; all rules live in
//! the services. Tenants authenticate with `Authorization: Bearer <key>`,
//! operators with the `X-Admin-Key` header.
//!
//! # Endpoints
//!
//! - `GET /health`, `GET /ready` - liveness and store readiness
//! - `POST /auth/register` - create a tenant, returns its key once
//! - `POST /auth/regenerate-key` - rotate a key
//! - `GET /auth/tenants`, `GET|PATCH /auth/tenants/{id}` - tenant administration
//! - `POST /jobs` - submit (201), `GET /jobs/{id}`, `/logs`, `/results`
//! - `GET /tenants/me/dashboard` - the caller's overview
//! - `GET /admin/cluster`, `/admin/jobs`, `/admin/activity` - operator views

#![deny(missing_docs)]

pub mod admin;
pub mod auth;
pub mod error;
pub mod jobs;
pub mod server;
pub mod tenants;

pub use error::{status_for, ApiError, ApiResult};
pub use server::{router, serve, AppState};
