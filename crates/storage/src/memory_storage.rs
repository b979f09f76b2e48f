//! In-process object store
//!
//! Behaves like the remote backends as far as the gateway can tell: objects
//! get a content-derived `ETag` and a `Last-Modified` stamp at write time, and
//! conditional GETs answer with [`StorageError::NotModified`].

use crate::{ObjectStorage, StorageError, StorageResult, StoredObject};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use imgate_common::{DownloadOptions, ETAG_HEADER, LAST_MODIFIED_HEADER};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    content_type: String,
    etag: String,
    modified: DateTime<Utc>,
}

/// `HashMap`-backed object store
pub struct MemoryObjectStorage {
    name: String,
    objects: RwLock<HashMap<String, Entry>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryObjectStorage {
    /// Create an empty store; `name` only shows up in logs
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Seed an object without counting it as a PUT
    pub async fn insert(&self, key: &str, data: impl Into<Bytes>, content_type: &str) {
        let entry = Self::entry(data.into(), content_type);
        self.objects.write().await.insert(key.to_string(), entry);
    }

    /// Simulate an outage: every GET and PUT fails until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of GETs served (including failed ones)
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of PUTs accepted
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    /// Raw bytes stored under `key`
    pub async fn data(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).map(|e| e.data.clone())
    }

    fn entry(data: Bytes, content_type: &str) -> Entry {
        let digest = Sha256::digest(&data);
        Entry {
            etag: format!("\"{}\"", URL_SAFE_NO_PAD.encode(&digest[..12])),
            data,
            content_type: content_type.to_string(),
            modified: Utc::now(),
        }
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Other(format!("store {} is unavailable", self.name)));
        }
        Ok(())
    }
}

fn entry_headers(entry: &Entry) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(ETAG_HEADER.to_string(), entry.etag.clone());
    headers.insert(
        LAST_MODIFIED_HEADER.to_string(),
        entry.modified.format(HTTP_DATE_FORMAT).to_string(),
    );
    headers
}

fn not_modified_since(entry: &Entry, since: &str) -> bool {
    DateTime::parse_from_rfc2822(since)
        .map(|since| entry.modified.timestamp() <= since.timestamp())
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn get_object(&self, key: &str, opts: &DownloadOptions) -> StorageResult<StoredObject> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let objects = self.objects.read().await;
        let entry = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", self.name, key)))?;

        let etag_match = opts
            .header("If-None-Match")
            .is_some_and(|expected| expected.trim_start_matches("W/") == entry.etag);
        let date_match = opts
            .header("If-Modified-Since")
            .is_some_and(|since| not_modified_since(entry, since));

        if etag_match || date_match {
            return Err(StorageError::NotModified {
                headers: entry_headers(entry),
            });
        }

        Ok(StoredObject {
            data: entry.data.clone(),
            content_type: Some(entry.content_type.clone()),
            headers: entry_headers(entry),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<Option<String>> {
        self.check_available()?;
        let entry = Self::entry(data, content_type);
        let etag = entry.etag.clone();
        self.objects.write().await.insert(key.to_string(), entry);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(Some(etag))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }
}
