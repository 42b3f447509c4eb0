//! Input payload validation
//!
//! A payload is a ZIP archive holding the simulation inputs. It is checked
//! before any orchestrator call so a malformed upload never costs a scope
//! apply or a quota slot.

use std::io::Cursor;

use simplane_common::config::AdmissionSettings;
use simplane_common::{Error, Result};
use zip::ZipArchive;

/// What admission learned from a valid payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadSummary {
    /// First archive entry carrying the required suffix
    pub config_file: String,
    /// Number of file entries
    pub files: usize,
    /// Archive size in bytes
    pub size: usize,
}

/// Validate a payload against the size bound and required-file rule
pub fn validate_payload(bytes: &[u8], settings: &AdmissionSettings) -> Result<PayloadSummary> {
    if bytes.is_empty() {
        return Err(Error::payload("payload is empty"));
    }
    if bytes.len() > settings.max_payload_bytes {
        return Err(Error::payload_too_large(format!(
            "payload is {} bytes, limit is {} bytes",
            bytes.len(),
            settings.max_payload_bytes
        )));
    }

    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::payload(format!("payload is not a valid zip archive: {e}")))?;

    let suffix = settings.required_suffix.to_ascii_lowercase();
    let mut config_file = None;
    let mut files = 0;
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| Error::payload(format!("unreadable archive entry {index}: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        files += 1;
        if config_file.is_none() && entry.name().to_ascii_lowercase().ends_with(&suffix) {
            config_file = Some(entry.name().to_string());
        }
    }

    let config_file = config_file.ok_or_else(|| {
        Error::payload(format!(
            "payload must contain a {} file",
            settings.required_suffix
        ))
    })?;

    Ok(PayloadSummary {
        config_file,
        files,
        size: bytes.len(),
    })
}
