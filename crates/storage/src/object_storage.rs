//! Object storage implementation using S3/MinIO
//!
//! Serves both the primary origin bucket and the derived-cache bucket. GETs
//! forward `If-None-Match` / `If-Modified-Since` so a conditional match comes
//! back as [`StorageError::NotModified`] without a body.

use crate::{collect_headers, ObjectStorage, StorageError, StorageResult, StoredObject};
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::{ByteStream, DateTime, DateTimeFormat},
    Client,
};
use bytes::Bytes;
use imgate_common::{DownloadOptions, ETAG_HEADER, LAST_MODIFIED_HEADER};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// S3/MinIO configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,

    /// AWS region (e.g., "us-west-2") or "us-east-1" for `MinIO`
    pub region: String,

    /// S3 endpoint (custom for `MinIO`, empty for AWS S3)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// AWS access key ID
    #[serde(default)]
    pub access_key_id: String,

    /// AWS secret access key
    #[serde(default)]
    pub secret_access_key: String,

    /// Path prefix for all objects (e.g., "images/")
    #[serde(default)]
    pub prefix: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "images".to_string(),
            region: "us-west-2".to_string(),
            endpoint: None,
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            prefix: String::new(),
        }
    }
}

/// S3/MinIO object storage implementation
pub struct S3ObjectStorage {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStorage {
    /// Create a new S3 object storage client
    pub fn new(config: S3Config) -> StorageResult<Self> {
        if config.bucket.trim().is_empty() {
            return Err(StorageError::InvalidConfig(
                "S3 bucket name must not be empty".to_string(),
            ));
        }

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "imgate-storage",
        );

        let region = Region::new(config.region.clone());

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(region)
            .behavior_version_latest();

        // Set custom endpoint for MinIO
        if let Some(endpoint) = config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true); // Required for MinIO
        }

        let s3_config = s3_config_builder.build();
        let client = Client::from_conf(s3_config);

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        })
    }

    /// Combine prefix with key
    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn get_object(&self, key: &str, opts: &DownloadOptions) -> StorageResult<StoredObject> {
        let full_key = self.full_key(key);

        let mut request = self.client.get_object().bucket(&self.bucket).key(&full_key);

        if let Some(etag) = opts.header("If-None-Match") {
            request = request.if_none_match(etag);
        }
        if let Some(since) = opts.header("If-Modified-Since") {
            match DateTime::from_str(since, DateTimeFormat::HttpDate) {
                Ok(since) => request = request.if_modified_since(since),
                Err(e) => debug!("Ignoring malformed If-Modified-Since {:?}: {}", since, e),
            }
        }

        let response = request.send().await.map_err(|e| {
            let status = e.raw_response().map(|r| r.status().as_u16());
            match status {
                Some(304) => StorageError::NotModified {
                    headers: e
                        .raw_response()
                        .map(|r| collect_headers(r.headers().iter()))
                        .unwrap_or_default(),
                },
                Some(404) => StorageError::NotFound(full_key.clone()),
                _ if e.to_string().contains("NoSuchKey") => {
                    StorageError::NotFound(full_key.clone())
                }
                _ => StorageError::S3Error(e.to_string()),
            }
        })?;

        let mut pairs: Vec<(&str, String)> = Vec::with_capacity(4);
        if let Some(etag) = response.e_tag() {
            pairs.push((ETAG_HEADER, etag.to_string()));
        }
        if let Some(modified) = response.last_modified() {
            if let Ok(formatted) = modified.fmt(DateTimeFormat::HttpDate) {
                pairs.push((LAST_MODIFIED_HEADER, formatted));
            }
        }
        if let Some(cache_control) = response.cache_control() {
            pairs.push((imgate_common::CACHE_CONTROL_HEADER, cache_control.to_string()));
        }
        if let Some(expires) = response.expires_string() {
            pairs.push((imgate_common::EXPIRES_HEADER, expires.to_string()));
        }
        let headers = collect_headers(pairs.iter().map(|(k, v)| (*k, v.as_str())));
        let content_type = response.content_type().map(ToString::to_string);

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(StoredObject {
            data: body.into_bytes(),
            content_type,
            headers,
        })
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<Option<String>> {
        let full_key = self.full_key(key);
        let byte_stream = ByteStream::from(data);

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(byte_stream)
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(output.e_tag().map(ToString::to_string))
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}
