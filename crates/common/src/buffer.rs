//! In-flight image buffers and their release contract
//!
//! An [`ImageBuffer`] has exactly one owner at a time. Whoever holds it last
//! releases it, either explicitly through [`ImageBuffer::release`] or by
//! dropping it. Substituting a buffer (e.g. a sanitized copy replacing the
//! raw fetch) goes through [`ImageBuffer::replace`], which releases the old
//! buffer before the new one takes its place.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::ImageFormat;

/// Origin validator header
pub const ETAG_HEADER: &str = "ETag";
/// Origin modification time header
pub const LAST_MODIFIED_HEADER: &str = "Last-Modified";
/// Origin freshness header
pub const CACHE_CONTROL_HEADER: &str = "Cache-Control";
/// Origin absolute expiry header
pub const EXPIRES_HEADER: &str = "Expires";
/// Tag set on the fallback image so freshness logic can apply its own TTL
pub const FALLBACK_IMAGE_HEADER: &str = "Fallback-Image";
/// Source dimensions recorded by the transformer
pub const ORIGIN_WIDTH_HEADER: &str = "X-Origin-Width";
pub const ORIGIN_HEIGHT_HEADER: &str = "X-Origin-Height";
/// Result dimensions recorded by the transformer
pub const RESULT_WIDTH_HEADER: &str = "X-Result-Width";
pub const RESULT_HEIGHT_HEADER: &str = "X-Result-Height";

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Owned image bytes plus type tag, headers and a one-shot release action
pub struct ImageBuffer {
    /// Detected or declared container format
    pub format: ImageFormat,
    /// Encoded image bytes
    pub data: Bytes,
    /// Headers attached by the store or the transformer
    pub headers: HashMap<String, String>,
    release: Mutex<Option<ReleaseFn>>,
}

impl ImageBuffer {
    /// Create a buffer with no headers and no release side effect
    pub fn new(format: ImageFormat, data: impl Into<Bytes>) -> Self {
        Self {
            format,
            data: data.into(),
            headers: HashMap::new(),
            release: Mutex::new(None),
        }
    }

    /// Attach headers
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Attach the action run when the buffer is released
    #[must_use]
    pub fn with_release<F>(self, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.set_release(release);
        self
    }

    /// Replace the release action. A previously set action is dropped without running.
    pub fn set_release<F>(&self, release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.release.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Box::new(release));
    }

    /// Length of the encoded data in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Look up a header value
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Run the release action. Safe to call any number of times; the action runs at most once.
    pub fn release(&self) {
        let action = {
            let mut slot = self.release.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(action) = action {
            action();
        }
    }

    /// Swap in `replacement` and release the buffer it supersedes
    pub fn replace(&mut self, replacement: ImageBuffer) {
        let previous = std::mem::replace(self, replacement);
        previous.release();
    }

    /// A copy sharing the same bytes and headers but carrying no release action.
    ///
    /// Used for long-lived buffers (the fallback image) handed to individual requests.
    #[must_use]
    pub fn detached_copy(&self) -> Self {
        Self {
            format: self.format,
            data: self.data.clone(),
            headers: self.headers.clone(),
            release: Mutex::new(None),
        }
    }
}

impl Drop for ImageBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("format", &self.format)
            .field("len", &self.data.len())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted(counter: &Arc<AtomicUsize>) -> ImageBuffer {
        let counter = counter.clone();
        ImageBuffer::new(ImageFormat::Png, vec![1u8, 2, 3]).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_release_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let buffer = counted(&counter);

        buffer.release();
        buffer.release();
        buffer.release();
        drop(buffer);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let counter = Arc::new(AtomicUsize::new(0));
        drop(counted(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replace_releases_previous() {
        let old_counter = Arc::new(AtomicUsize::new(0));
        let new_counter = Arc::new(AtomicUsize::new(0));

        let mut buffer = counted(&old_counter);
        buffer.replace(counted(&new_counter));

        assert_eq!(old_counter.load(Ordering::SeqCst), 1);
        assert_eq!(new_counter.load(Ordering::SeqCst), 0);

        drop(buffer);
        assert_eq!(new_counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_copy_has_no_release() {
        let counter = Arc::new(AtomicUsize::new(0));
        let buffer = counted(&counter);

        let copy = buffer.detached_copy();
        assert_eq!(copy.data, buffer.data);
        drop(copy);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        drop(buffer);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_header_lookup() {
        let mut headers = HashMap::new();
        headers.insert(ETAG_HEADER.to_string(), "\"abc\"".to_string());
        let buffer = ImageBuffer::new(ImageFormat::Jpeg, Vec::new()).with_headers(headers);

        assert_eq!(buffer.header(ETAG_HEADER), Some("\"abc\""));
        assert_eq!(buffer.header(EXPIRES_HEADER), None);
        assert!(buffer.is_empty());
    }
}
