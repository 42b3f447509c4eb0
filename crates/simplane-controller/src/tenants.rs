//! Tenant registry
//!
//! Owns tenant identity, credential lookup and quota limits. Credentials are
//! stored only as digests; the plaintext leaves this module exactly once, in
//! the [`Registration`] or from [`TenantRegistry::regenerate_credential`].

use std::sync::Arc;

use chrono::Utc;
use simplane_common::config::TenantSettings;
use simplane_common::credential::{parse_authorization, secrets_match, Credential};
use simplane_common::tenant::{scope_name_for, validate_tenant_id};
use simplane_common::{Error, LimitsPatch, Result, Tenant};
use simplane_store::{Store, TenantStore};
use tracing::{debug, info, warn};

/// A newly registered tenant together with its one-time plaintext credential
#[derive(Debug, Clone)]
pub struct Registration {
    /// The stored tenant
    pub tenant: Tenant,
    /// Plaintext credential, not retrievable again
    pub credential: Credential,
}

/// Tenant registration, authentication and limits management
pub struct TenantRegistry {
    store: Arc<dyn Store>,
    settings: TenantSettings,
    admin_key: Option<String>,
}

impl TenantRegistry {
    /// Create a registry over `store`
    pub fn new(store: Arc<dyn Store>, settings: TenantSettings, admin_key: Option<String>) -> Self {
        Self {
            store,
            settings,
            admin_key,
        }
    }

    fn fresh_credential() -> Result<Credential> {
        Credential::generate().map_err(|e| Error::storage("generate_credential", e.to_string()))
    }

    /// Register a tenant
    ///
    /// Unspecified limits take the configured defaults. Fails with `Conflict`
    /// when the identifier or its derived scope name is already taken.
    pub async fn register(&self, tenant_id: &str, limits: &LimitsPatch) -> Result<Registration> {
        let tenant_id = tenant_id.trim();
        validate_tenant_id(tenant_id)?;
        let namespace = scope_name_for(tenant_id)?;
        limits.validate(&self.settings.ceiling)?;

        let credential = Self::fresh_credential()?;
        let tenant = Tenant {
            tenant_id: tenant_id.to_string(),
            namespace,
            credential_hash: credential.hash(),
            limits: self.settings.defaults.merge(limits),
            created_at: Utc::now(),
        };
        self.store.insert_tenant(&tenant).await?;

        info!(
            tenant = %tenant.tenant_id,
            namespace = %tenant.namespace,
            max_cpu = tenant.limits.max_cpu,
            max_memory_gi = tenant.limits.max_memory_gi,
            max_concurrent_jobs = tenant.limits.max_concurrent_jobs,
            "tenant registered"
        );
        Ok(Registration { tenant, credential })
    }

    /// Resolve an `Authorization` header value (`Bearer <key>` or `<key>`) to a tenant
    pub async fn authenticate(&self, presented: &str) -> Result<Tenant> {
        let key = parse_authorization(presented)
            .ok_or_else(|| Error::unauthorized("missing credential"))?;
        let credential = Credential::from_presented(key);

        match self
            .store
            .find_tenant_by_credential(&credential.hash())
            .await?
        {
            Some(tenant) => Ok(tenant),
            None => {
                debug!(prefix = %credential.log_prefix(), "unknown credential presented");
                Err(Error::unauthorized("invalid credential"))
            }
        }
    }

    /// Look up a tenant by identifier
    pub async fn get(&self, tenant_id: &str) -> Result<Tenant> {
        self.store
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| Error::not_found("tenant", tenant_id))
    }

    /// All tenants, newest first
    pub async fn list(&self) -> Result<Vec<Tenant>> {
        Ok(self.store.list_tenants().await?)
    }

    /// Apply a partial limits update
    ///
    /// Only the stored limits change here. Callers re-apply the tenant's scope
    /// with [`AdmissionController::provision_scope`] to move its ceilings; every
    /// submission re-applies it as well.
    ///
    /// [`AdmissionController::provision_scope`]: crate::AdmissionController::provision_scope
    pub async fn update_limits(&self, tenant_id: &str, patch: &LimitsPatch) -> Result<Tenant> {
        if patch.is_empty() {
            return Err(Error::validation("no limits supplied"));
        }
        patch.validate(&self.settings.ceiling)?;

        let current = self.get(tenant_id).await?;
        let merged = current.limits.merge(patch);
        let tenant = self.store.update_limits(tenant_id, &merged).await?;

        info!(
            tenant = %tenant_id,
            max_cpu = merged.max_cpu,
            max_memory_gi = merged.max_memory_gi,
            max_concurrent_jobs = merged.max_concurrent_jobs,
            "tenant limits updated"
        );
        Ok(tenant)
    }

    /// Replace a tenant's credential; the old one stops working immediately
    pub async fn regenerate_credential(&self, tenant_id: &str) -> Result<Credential> {
        let credential = Self::fresh_credential()?;
        self.store
            .rotate_credential(tenant_id, &credential.hash())
            .await?;
        info!(tenant = %tenant_id, "tenant credential regenerated");
        Ok(credential)
    }

    /// Check an administrative key
    ///
    /// With no admin key configured every administrative call is refused.
    pub fn authorize_admin(&self, presented: Option<&str>) -> Result<()> {
        let Some(expected) = self.admin_key.as_deref() else {
            warn!("administrative call refused: no admin key configured");
            return Err(Error::forbidden("administrative access is disabled"));
        };
        let presented = presented
            .and_then(parse_authorization)
            .ok_or_else(|| Error::unauthorized("missing admin key"))?;
        if secrets_match(presented, expected) {
            Ok(())
        } else {
            Err(Error::forbidden("invalid admin key"))
        }
    }
}
