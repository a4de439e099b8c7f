//! Per-provider upload constraints (size cap and MIME allow-list)

use mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upload limits for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Largest accepted object in bytes (default: 20MB)
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,

    /// Accepted MIME types; `type/*` matches a whole top-level type and an
    /// empty list accepts everything
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

fn default_max_size_bytes() -> u64 {
    20 * 1024 * 1024 // 20MB
}

fn default_allowed_mime_types() -> Vec<String> {
    [
        "image/*",
        "text/plain",
        "text/csv",
        "application/pdf",
        "application/zip",
        "application/msword",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/vnd.ms-excel",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            allowed_mime_types: default_allowed_mime_types(),
        }
    }
}

/// Why a file was refused by a provider
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LimitViolation {
    #[error("file is {size} bytes, limit is {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("MIME type {mime} is not accepted")]
    TypeRejected { mime: String },
}

impl ProviderLimits {
    /// Accept everything up to `max_size_bytes`
    #[cfg(test)]
    pub fn unrestricted(max_size_bytes: u64) -> Self {
        Self {
            max_size_bytes,
            allowed_mime_types: Vec::new(),
        }
    }

    pub fn allows_mime(&self, mime_type: &str) -> bool {
        if self.allowed_mime_types.is_empty() {
            return true;
        }
        let Ok(candidate) = mime_type.parse::<Mime>() else {
            return false;
        };

        self.allowed_mime_types.iter().any(|allowed| {
            let Ok(allowed) = allowed.parse::<Mime>() else {
                return false;
            };
            let type_matches = allowed.type_() == mime::STAR || allowed.type_() == candidate.type_();
            let subtype_matches = allowed.subtype() == mime::STAR || allowed.subtype() == candidate.subtype();
            type_matches && subtype_matches
        })
    }

    /// Check a file against these limits; size is checked first
    pub fn validate(&self, size: u64, mime_type: &str) -> Result<(), LimitViolation> {
        if size > self.max_size_bytes {
            return Err(LimitViolation::SizeExceeded {
                size,
                limit: self.max_size_bytes,
            });
        }
        if !self.allows_mime(mime_type) {
            return Err(LimitViolation::TypeRejected {
                mime: mime_type.to_string(),
            });
        }
        Ok(())
    }
}
