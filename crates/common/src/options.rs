//! Processing and download options

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ImageFormat;

/// Per-fetch security limits
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SecurityOptions {
    /// Reject source objects larger than this many bytes
    #[serde(default)]
    pub max_src_file_size: Option<usize>,
    /// Reject decoded sources larger than this many megapixels
    #[serde(default)]
    pub max_src_resolution: Option<f64>,
}

/// Structured form of the requested transformation.
///
/// Produced once by the path parser, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Target width, 0 keeps the source width
    pub width: u32,
    /// Target height, 0 keeps the source height
    pub height: u32,
    /// Target format; `Unknown` keeps the source format
    pub format: ImageFormat,
    /// Encoder quality (1-100), 0 selects the encoder default
    pub quality: u8,
    /// Source formats returned untouched when no conversion is requested
    pub skip_processing_formats: Vec<ImageFormat>,
    /// Stream the origin bytes without any processing
    pub raw: bool,
    /// Freshness override as a unix timestamp (seconds)
    pub expires: Option<i64>,
    /// Limits applied while fetching and decoding the source
    pub security: SecurityOptions,
}

impl ProcessingOptions {
    /// Options that only convert to `format`, keeping the source dimensions
    #[must_use]
    pub fn convert_to(format: ImageFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }

    /// Whether the options ask for a resize
    #[must_use]
    pub fn resizes(&self) -> bool {
        self.width > 0 || self.height > 0
    }
}

/// Per-fetch overrides, built fresh for every request
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Extra request headers (conditional validators, `Accept`)
    pub headers: HashMap<String, String>,
    /// Cookie header forwarded to HTTP origins
    pub cookies: Option<String>,
}

impl DownloadOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, ignoring empty values
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if !value.is_empty() {
            self.headers.insert(name.to_string(), value.to_string());
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
