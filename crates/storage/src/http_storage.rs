//! Read-only HTTP origin
//!
//! Objects are fetched from `<base_url>/<key>`. Extra headers and the cookie
//! jar from [`DownloadOptions`] are forwarded, so conditional requests and
//! cookie passthrough work against HTTP origins as well.

use crate::{collect_headers, ObjectStorage, StorageError, StorageResult, StoredObject};
use bytes::Bytes;
use imgate_common::DownloadOptions;
use reqwest::{header, Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// HTTP origin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Base URL objects are resolved against (e.g. `https://cdn.example.com/images`)
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// HTTP/HTTPS origin storage
pub struct HttpObjectStorage {
    client: HttpClient,
    base_url: String,
}

impl HttpObjectStorage {
    /// Create a new HTTP origin client
    pub fn new(config: HttpConfig) -> StorageResult<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();

        // Validate URL scheme
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(StorageError::InvalidConfig(format!(
                "Invalid base URL {base_url:?}. Only http:// and https:// are supported"
            )));
        }

        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StorageError::InvalidConfig(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}

#[async_trait::async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn get_object(&self, key: &str, opts: &DownloadOptions) -> StorageResult<StoredObject> {
        let url = self.object_url(key);
        debug!("Downloading object from URL: {}", url);

        let mut request = self.client.get(&url);
        for (name, value) in &opts.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(cookies) = &opts.cookies {
            request = request.header(header::COOKIE, cookies.as_str());
        }

        let response = request.send().await.map_err(|e| StorageError::Http {
            status: e.status().map_or(502, |s| s.as_u16()),
            message: format!("Failed to send HTTP request: {e}"),
        })?;

        let headers = collect_headers(
            response
                .headers()
                .iter()
                .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?))),
        );

        match response.status() {
            StatusCode::NOT_MODIFIED => return Err(StorageError::NotModified { headers }),
            StatusCode::NOT_FOUND => return Err(StorageError::NotFound(url)),
            status if !status.is_success() => {
                return Err(StorageError::Http {
                    status: status.as_u16(),
                    message: format!("HTTP request failed with status: {status}"),
                })
            }
            _ => {}
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .map(ToString::to_string);

        let data = response.bytes().await.map_err(|e| StorageError::Http {
            status: 502,
            message: format!("Failed to read response body: {e}"),
        })?;

        debug!("Downloaded {} bytes from {}", data.len(), url);

        Ok(StoredObject {
            data,
            content_type,
            headers,
        })
    }

    async fn put_object(
        &self,
        key: &str,
        _data: Bytes,
        _content_type: &str,
    ) -> StorageResult<Option<String>> {
        Err(StorageError::Unsupported(format!(
            "HTTP origin is read-only, can't store {key}"
        )))
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}
