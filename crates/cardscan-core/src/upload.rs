//! Upfront validation of scan uploads.
//!
//! These checks run before any resilience work. Failures are client
//! errors: they are never retried and never touch a circuit breaker.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

lazy_static! {
    /// `type/subtype`, optionally followed by `; parameters`.
    static ref MEDIA_TYPE_PATTERN: Regex =
        Regex::new(r"^\s*([A-Za-z0-9!#$&^_.+-]+/[A-Za-z0-9!#$&^_.+-]+)\s*(?:;.*)?$").unwrap();
}

/// Default upload limit: 10 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Errors returned for uploads the pipeline refuses to scan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("Invalid file type '{content_type}'. Please upload an image (jpg, png, webp, gif).")]
    UnsupportedMediaType { content_type: String },

    #[error("Image too large: {size} bytes exceeds maximum {max} bytes")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("Empty upload")]
    Empty,
}

impl UploadError {
    /// HTTP status a route layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            UploadError::UnsupportedMediaType { .. } => 400,
            UploadError::PayloadTooLarge { .. } => 413,
            UploadError::Empty => 400,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::UnsupportedMediaType { .. } => "invalid_content_type",
            UploadError::PayloadTooLarge { .. } => "payload_too_large",
            UploadError::Empty => "empty_upload",
        }
    }
}

/// Upload limits for the scan endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanLimits {
    /// Accepted media types, compared case-insensitively
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,

    /// Maximum upload size in bytes
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_allowed_types() -> Vec<String> {
    ["image/jpeg", "image/png", "image/webp", "image/gif"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}

fn default_max_bytes() -> u64 {
    DEFAULT_MAX_UPLOAD_BYTES
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            allowed_types: default_allowed_types(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl ScanLimits {
    /// Validate an upload.
    ///
    /// `content_length` is the declared size; the actual byte count is
    /// checked as well so a lying header cannot sneak a large body through.
    pub fn validate(
        &self,
        content_type: &str,
        content_length: u64,
        actual_len: usize,
    ) -> Result<(), UploadError> {
        let media_type = media_type(content_type).ok_or_else(|| {
            UploadError::UnsupportedMediaType {
                content_type: content_type.to_string(),
            }
        })?;

        if !self
            .allowed_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&media_type))
        {
            return Err(UploadError::UnsupportedMediaType {
                content_type: content_type.to_string(),
            });
        }

        let size = content_length.max(actual_len as u64);
        if size > self.max_bytes {
            return Err(UploadError::PayloadTooLarge {
                size,
                max: self.max_bytes,
            });
        }

        if actual_len == 0 {
            return Err(UploadError::Empty);
        }

        Ok(())
    }
}

/// Extract the lowercase `type/subtype` from a Content-Type header value.
pub fn media_type(content_type: &str) -> Option<String> {
    MEDIA_TYPE_PATTERN
        .captures(content_type)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}
