//! Storage layer for the image gateway
//!
//! Two logical namespaces are served by this crate:
//! - **Primary origin**: the authoritative store holding untransformed source images
//! - **Derived cache**: pre-transformed copies in the cache-preferred format,
//!   addressed by the normalized reference and populated lazily
//!
//! Both are accessed through the same [`ObjectStorage`] trait. Backends:
//! - [`S3ObjectStorage`]: S3 / `MinIO` buckets
//! - [`HttpObjectStorage`]: read-only HTTP origin
//! - [`MemoryObjectStorage`]: in-process map, used by tests and local runs
//!
//! # Example
//!
//! ```rust,no_run
//! use imgate_common::DownloadOptions;
//! use imgate_storage::{MemoryObjectStorage, ObjectStorage};
//!
//! # async fn demo() -> imgate_storage::StorageResult<()> {
//! let storage = MemoryObjectStorage::new("derived");
//! storage.put_object("0x0/photos/a.jpg", b"...".to_vec().into(), "image/avif").await?;
//! let object = storage.get_object("0x0/photos/a.jpg", &DownloadOptions::new()).await?;
//! assert_eq!(&object.data[..], b"...");
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use imgate_common::{DownloadOptions, GatewayError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod http_storage;
pub mod memory_storage;
pub mod object_storage;

pub use http_storage::{HttpConfig, HttpObjectStorage};
pub use memory_storage::MemoryObjectStorage;
pub use object_storage::{S3Config, S3ObjectStorage};

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Conditional GET matched; carries the origin's response headers
    #[error("Object not modified")]
    NotModified { headers: HashMap<String, String> },

    #[error("Origin responded with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl StorageError {
    /// HTTP status that best describes the failure, if one is known
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(404),
            Self::NotModified { .. } => Some(304),
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        let status = err.status();
        let mut gateway = GatewayError::download(err.to_string());
        if let Some(status) = status {
            gateway = gateway.with_status(status);
        }
        gateway
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Object returned by a GET
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object bytes
    pub data: Bytes,
    /// Declared content type, if the store recorded one
    pub content_type: Option<String>,
    /// Validator and freshness headers (`ETag`, `Last-Modified`, `Cache-Control`, `Expires`)
    pub headers: HashMap<String, String>,
}

/// Key-addressed byte store
#[async_trait::async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch an object. Conditional headers in `opts` may yield [`StorageError::NotModified`].
    async fn get_object(&self, key: &str, opts: &DownloadOptions) -> StorageResult<StoredObject>;

    /// Store an object, overwriting any previous version.
    ///
    /// Returns the ETag of the stored version when the backend reports one.
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<Option<String>>;

    /// Human-readable location used in logs (e.g. `s3://bucket/prefix`)
    fn describe(&self) -> String;
}

/// Backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    S3,
    Http,
    #[default]
    Memory,
}

/// Configuration for one store namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    #[serde(default)]
    pub s3: S3Config,

    #[serde(default)]
    pub http: HttpConfig,
}

/// Build the backend described by `config`
pub fn build_storage(name: &str, config: &StoreConfig) -> StorageResult<Arc<dyn ObjectStorage>> {
    let storage: Arc<dyn ObjectStorage> = match config.kind {
        StoreKind::S3 => Arc::new(S3ObjectStorage::new(config.s3.clone())?),
        StoreKind::Http => Arc::new(HttpObjectStorage::new(config.http.clone())?),
        StoreKind::Memory => Arc::new(MemoryObjectStorage::new(name)),
    };
    tracing::info!(store = name, location = %storage.describe(), "Object store configured");
    Ok(storage)
}

/// Copy the validator and freshness headers a store response carries
pub(crate) fn collect_headers<'a, I>(pairs: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    const KEPT: [&str; 4] = [
        imgate_common::ETAG_HEADER,
        imgate_common::LAST_MODIFIED_HEADER,
        imgate_common::CACHE_CONTROL_HEADER,
        imgate_common::EXPIRES_HEADER,
    ];

    let mut headers = HashMap::new();
    for (name, value) in pairs {
        if let Some(canonical) = KEPT.iter().find(|k| k.eq_ignore_ascii_case(name)) {
            if !value.is_empty() {
                headers.insert((*canonical).to_string(), value.to_string());
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgate_common::ErrorKind;

    #[test]
    fn test_not_found_maps_to_404() {
        let err: GatewayError = StorageError::NotFound("photos/a.jpg".to_string()).into();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.kind(), ErrorKind::Download);
    }

    #[test]
    fn test_unclassified_error_has_no_status() {
        let err: GatewayError = StorageError::S3Error("connection reset".to_string()).into();
        assert_eq!(err.status(), None);
        assert_eq!(err.status_or_default(), 500);
    }

    #[test]
    fn test_collect_headers_canonicalizes_names() {
        let headers = collect_headers([
            ("etag", "\"abc\""),
            ("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
            ("x-amz-request-id", "123"),
            ("cache-control", ""),
        ]);

        assert_eq!(headers.get("ETag").map(String::as_str), Some("\"abc\""));
        assert!(headers.contains_key("Last-Modified"));
        assert!(!headers.contains_key("Cache-Control"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_store_config_default_is_memory() {
        let config = StoreConfig::default();
        assert_eq!(config.kind, StoreKind::Memory);
        let storage = build_storage("test", &config).unwrap();
        assert!(storage.describe().contains("test"));
    }
}
