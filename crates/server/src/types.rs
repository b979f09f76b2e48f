//! API request and response types

use serde::{Deserialize, Serialize};

use crate::refresh::RefreshResult;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Query of `PUT /admin/master/refresh`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshQuery {
    #[serde(default)]
    pub path: Option<String>,
}

/// Body of `POST /master/refresh`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub path: String,
}

/// Successful admin refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    /// Always `updated`
    pub status: String,
    pub path: String,
    pub master_key: String,
    pub format: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bytes: usize,
    /// RFC 3339, UTC
    pub processed_at: String,
}

impl From<RefreshResult> for RefreshResponse {
    fn from(result: RefreshResult) -> Self {
        Self {
            status: "updated".to_string(),
            path: result.path,
            master_key: result.master_key,
            format: result.format.to_string(),
            width: result.width,
            height: result.height,
            bytes: result.bytes,
            processed_at: result
                .processed_at
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
