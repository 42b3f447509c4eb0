//! Tenant identity and quota limits

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Maximum length of a tenant identifier
pub const MAX_TENANT_ID_LEN: usize = 100;

/// Maximum length of a DNS-1123 label (namespace names)
const MAX_DNS_LABEL_LEN: usize = 63;

/// Resource ceilings for a tenant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantLimits {
    /// Maximum aggregate CPU cores across the tenant's running units
    pub max_cpu: u32,
    /// Maximum aggregate memory in GiB
    pub max_memory_gi: u32,
    /// Maximum jobs in PENDING or RUNNING at once
    pub max_concurrent_jobs: u32,
}

impl TenantLimits {
    /// Apply a partial update, returning the merged limits
    pub fn merge(&self, patch: &LimitsPatch) -> TenantLimits {
        TenantLimits {
            max_cpu: patch.max_cpu.unwrap_or(self.max_cpu),
            max_memory_gi: patch.max_memory_gi.unwrap_or(self.max_memory_gi),
            max_concurrent_jobs: patch.max_concurrent_jobs.unwrap_or(self.max_concurrent_jobs),
        }
    }
}

/// Partial limits for registration and administrative updates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsPatch {
    /// New CPU ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<u32>,
    /// New memory ceiling in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_gi: Option<u32>,
    /// New concurrent-job ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<u32>,
}

impl LimitsPatch {
    /// Whether no field is set
    pub fn is_empty(&self) -> bool {
        self.max_cpu.is_none() && self.max_memory_gi.is_none() && self.max_concurrent_jobs.is_none()
    }

    /// Validate every supplied field against an administrative ceiling
    pub fn validate(&self, ceiling: &TenantLimits) -> Result<(), Error> {
        check_limit("max_cpu", self.max_cpu, ceiling.max_cpu)?;
        check_limit("max_memory_gi", self.max_memory_gi, ceiling.max_memory_gi)?;
        check_limit(
            "max_concurrent_jobs",
            self.max_concurrent_jobs,
            ceiling.max_concurrent_jobs,
        )
    }
}

fn check_limit(field: &str, value: Option<u32>, ceiling: u32) -> Result<(), Error> {
    match value {
        Some(v) if v == 0 || v > ceiling => Err(Error::validation_field(
            field,
            format!("{field} ({v}) must be between 1 and {ceiling}"),
        )),
        _ => Ok(()),
    }
}

/// A registered tenant
///
/// The credential itself is never stored; `credential_hash` holds its digest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Unique tenant identifier
    pub tenant_id: String,
    /// Isolated execution scope (namespace), immutable once created
    pub namespace: String,
    /// Digest of the tenant's current credential
    #[serde(skip_serializing)]
    pub credential_hash: String,
    /// Current resource ceilings
    pub limits: TenantLimits,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

/// Validate a tenant identifier
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), Error> {
    if tenant_id.trim().is_empty() {
        return Err(Error::validation_field("tenant_id", "tenant_id must not be empty"));
    }
    if tenant_id.len() > MAX_TENANT_ID_LEN {
        return Err(Error::validation_field(
            "tenant_id",
            format!("tenant_id must be at most {MAX_TENANT_ID_LEN} characters"),
        ));
    }
    Ok(())
}

/// Derive the isolated-execution-scope name for a tenant identifier
///
/// Lower-cases and maps `_` and spaces to `-`, then requires the result to be a
/// valid DNS-1123 label.
pub fn scope_name_for(tenant_id: &str) -> Result<String, Error> {
    let name: String = tenant_id
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == ' ' { '-' } else { c })
        .collect();

    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_ends = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_alphanumeric());

    if name.is_empty() || name.len() > MAX_DNS_LABEL_LEN || !valid_chars || !valid_ends {
        return Err(Error::validation_field(
            "tenant_id",
            format!("tenant_id '{tenant_id}' does not map to a valid namespace name ('{name}')"),
        ));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceiling() -> TenantLimits {
        TenantLimits {
            max_cpu: 100,
            max_memory_gi: 500,
            max_concurrent_jobs: 50,
        }
    }

    #[test]
    fn test_scope_name_normalizes_tenant_id() {
        assert_eq!(scope_name_for("Acme_Corp").unwrap(), "acme-corp");
        assert_eq!(scope_name_for("team blue").unwrap(), "team-blue");
        assert_eq!(scope_name_for("tenant42").unwrap(), "tenant42");
    }

    #[test]
    fn test_scope_name_rejects_invalid_labels() {
        assert!(scope_name_for("").is_err());
        assert!(scope_name_for("_leading").is_err());
        assert!(scope_name_for("dots.not.allowed").is_err());
        assert!(scope_name_for(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_limits_patch_validation() {
        let ok = LimitsPatch {
            max_cpu: Some(4),
            ..Default::default()
        };
        assert!(ok.validate(&ceiling()).is_ok());

        let zero = LimitsPatch {
            max_concurrent_jobs: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            zero.validate(&ceiling()),
            Err(Error::Validation { field: Some(f), .. }) if f == "max_concurrent_jobs"
        ));

        let too_big = LimitsPatch {
            max_memory_gi: Some(501),
            ..Default::default()
        };
        assert!(too_big.validate(&ceiling()).is_err());
    }

    #[test]
    fn test_merge_keeps_unspecified_fields() {
        let limits = TenantLimits {
            max_cpu: 10,
            max_memory_gi: 20,
            max_concurrent_jobs: 2,
        };
        let merged = limits.merge(&LimitsPatch {
            max_concurrent_jobs: Some(5),
            ..Default::default()
        });
        assert_eq!(merged.max_cpu, 10);
        assert_eq!(merged.max_memory_gi, 20);
        assert_eq!(merged.max_concurrent_jobs, 5);
        assert!(LimitsPatch::default().is_empty());
    }

    #[test]
    fn test_tenant_id_length_bound() {
        assert!(validate_tenant_id("acme").is_ok());
        assert!(validate_tenant_id("   ").is_err());
        assert!(validate_tenant_id(&"x".repeat(101)).is_err());
    }
}
