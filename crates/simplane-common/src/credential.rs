//! Tenant credential generation and hashing
//!
//! Credentials are `sk-` followed by 32 alphanumeric characters drawn from the
//! FIPS-validated RNG (about 190 bits of entropy). Only the SHA-256 digest is
//! ever persisted; the plaintext leaves the process exactly once.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use thiserror::Error;

/// Prefix carried by every tenant credential
pub const CREDENTIAL_PREFIX: &str = "sk-";

/// Number of random characters after the prefix
pub const CREDENTIAL_RANDOM_LEN: usize = 32;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Largest byte value that maps uniformly onto the alphabet (62 * 4)
const UNBIASED_LIMIT: u8 = 248;

/// Error type for credential generation failures
#[derive(Debug, Error)]
#[error("failed to generate cryptographically secure random bytes: FIPS RNG unavailable")]
pub struct CredentialGenerationError;

/// A plaintext tenant credential
///
/// Debug output shows only the digest.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Generate a fresh random credential
    pub fn generate() -> Result<Self, CredentialGenerationError> {
        let mut out = String::with_capacity(CREDENTIAL_PREFIX.len() + CREDENTIAL_RANDOM_LEN);
        out.push_str(CREDENTIAL_PREFIX);

        let mut buf = [0u8; 64];
        while out.len() < CREDENTIAL_PREFIX.len() + CREDENTIAL_RANDOM_LEN {
            aws_lc_rs::rand::fill(&mut buf).map_err(|_| CredentialGenerationError)?;
            for b in buf {
                if b < UNBIASED_LIMIT && out.len() < CREDENTIAL_PREFIX.len() + CREDENTIAL_RANDOM_LEN
                {
                    out.push(ALPHABET[(b % ALPHABET.len() as u8) as usize] as char);
                }
            }
        }
        Ok(Self(out))
    }

    /// Wrap a presented credential for lookup
    pub fn from_presented(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Plaintext value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digest used for storage and lookup
    pub fn hash(&self) -> String {
        hash_credential(&self.0)
    }

    /// Short non-secret prefix for debug logging
    pub fn log_prefix(&self) -> &str {
        let end = self.0.len().min(CREDENTIAL_PREFIX.len() + 4);
        self.0.get(..end).unwrap_or("")
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("hash", &self.hash())
            .finish()
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 digest of a credential string, URL-safe base64 encoded
pub fn hash_credential(credential: &str) -> String {
    use aws_lc_rs::digest::{digest, SHA256};
    let hash = digest(&SHA256, credential.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Extract the credential from an `Authorization` header value
///
/// Accepts `Bearer <key>` or a bare key. Returns `None` for an empty value.
pub fn parse_authorization(header: &str) -> Option<&str> {
    let trimmed = header.trim();
    let key = match trimmed.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        None if trimmed.eq_ignore_ascii_case("bearer") => "",
        _ => trimmed,
    };
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// Compare a presented secret against the configured one in constant time
pub fn secrets_match(presented: &str, expected: &str) -> bool {
    aws_lc_rs::constant_time::verify_slices_are_equal(presented.as_bytes(), expected.as_bytes())
        .is_ok()
}
