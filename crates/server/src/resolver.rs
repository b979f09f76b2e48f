//! Origin resolution
//!
//! A reference is looked up in the derived cache first, under its normalized
//! `0x0/` key. On a miss the source is fetched from the primary store,
//! converted to the cache format and written back, and the converted copy
//! serves the request. If that fails too, the configured fallback image stands
//! in with a degraded status.
//!
//! Concurrent misses for the same key are not coalesced: each one fetches,
//! converts and writes. Writes of identical input are idempotent.

use imgate_common::{
    DownloadOptions, ErrorKind, GatewayError, ImageBuffer, ImageFormat, ProcessingOptions,
    RequestContext, SecurityOptions, ETAG_HEADER,
};
use imgate_storage::{ObjectStorage, StorageError, StoredObject};
use imgate_transform::Transformer;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::security::check_file_size;

/// Key prefix of untransformed, cache-format copies
pub const NO_TRANSFORM_PREFIX: &str = "0x0/";

/// Derived-cache key for `reference`. Idempotent.
pub fn normalize(reference: &str) -> String {
    if reference.starts_with(NO_TRANSFORM_PREFIX) {
        reference.to_string()
    } else {
        format!("{NO_TRANSFORM_PREFIX}{}", reference.trim_start_matches('/'))
    }
}

/// Result of a single store fetch
#[derive(Debug)]
pub enum Fetched {
    Image(ImageBuffer),
    /// The store's copy matches the request's validators
    NotModified(HashMap<String, String>),
}

/// Result of resolving a reference for the image endpoint
#[derive(Debug)]
pub enum Resolution {
    Found(ImageBuffer),
    /// Origin failed; the fallback image is served with `status`
    Fallback {
        image: ImageBuffer,
        status: u16,
        cause: GatewayError,
    },
    NotModified(HashMap<String, String>),
}

fn buffer_from_object(object: StoredObject) -> ImageBuffer {
    let format = match ImageFormat::sniff(&object.data) {
        ImageFormat::Unknown => object
            .content_type
            .as_deref()
            .and_then(ImageFormat::from_mime)
            .unwrap_or_default(),
        sniffed => sniffed,
    };
    ImageBuffer::new(format, object.data).with_headers(object.headers)
}

pub struct OriginResolver {
    primary: Arc<dyn ObjectStorage>,
    derived: Arc<dyn ObjectStorage>,
    transformer: Arc<dyn Transformer>,
    cache_format: ImageFormat,
    fallback: Option<ImageBuffer>,
    fallback_status: u16,
    report_downloading_errors: bool,
}

impl OriginResolver {
    pub fn new(
        primary: Arc<dyn ObjectStorage>,
        derived: Arc<dyn ObjectStorage>,
        transformer: Arc<dyn Transformer>,
        cache_format: ImageFormat,
    ) -> Self {
        Self {
            primary,
            derived,
            transformer,
            cache_format,
            fallback: None,
            fallback_status: 0,
            report_downloading_errors: false,
        }
    }

    /// Serve `image` when resolution fails. `status` 0 keeps the failure's status.
    #[must_use]
    pub fn with_fallback(mut self, image: Option<ImageBuffer>, status: u16) -> Self {
        self.fallback = image;
        self.fallback_status = status;
        self
    }

    /// Flag resolution failures for exception reporting
    #[must_use]
    pub fn with_report_downloading_errors(mut self, report: bool) -> Self {
        self.report_downloading_errors = report;
        self
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    async fn fetch(
        &self,
        ctx: &RequestContext,
        store: &dyn ObjectStorage,
        key: &str,
        opts: &DownloadOptions,
        security: &SecurityOptions,
    ) -> Result<Fetched, GatewayError> {
        let result = ctx
            .run(async { Ok(store.get_object(key, opts).await) })
            .await?;

        match result {
            Ok(object) => {
                check_file_size(security, object.data.len())?;
                Ok(Fetched::Image(buffer_from_object(object)))
            }
            Err(StorageError::NotModified { headers }) => Ok(Fetched::NotModified(headers)),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch `reference` from the primary store as-is (raw passthrough)
    pub async fn fetch_primary(
        &self,
        ctx: &RequestContext,
        reference: &str,
        opts: &DownloadOptions,
        security: &SecurityOptions,
    ) -> Result<Fetched, GatewayError> {
        self.fetch(ctx, &*self.primary, reference.trim_start_matches('/'), opts, security)
            .await
            .map_err(|e| e.wrap("Can't download source image", None, false))
    }

    /// Resolve `reference` for the image endpoint
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        reference: &str,
        opts: &DownloadOptions,
        po: &ProcessingOptions,
    ) -> Result<Resolution, GatewayError> {
        let key = normalize(reference);

        let mut derived_opts = opts.clone();
        derived_opts.set_header("Accept", self.cache_format.mime());

        match self
            .fetch(ctx, &*self.derived, &key, &derived_opts, &po.security)
            .await
        {
            Ok(Fetched::Image(image)) => return Ok(Resolution::Found(image)),
            Ok(Fetched::NotModified(headers)) => return Ok(Resolution::NotModified(headers)),
            Err(err) if matches!(err.kind(), ErrorKind::Cancelled | ErrorKind::Timeout) => {
                return Err(err)
            }
            Err(err) => debug!("Derived cache miss for {}: {}", key, err),
        }

        let err = match self
            .populate_derived_cache(ctx, &key, opts, &po.security)
            .await
        {
            Ok(Fetched::Image(image)) => return Ok(Resolution::Found(image)),
            Ok(Fetched::NotModified(headers)) => return Ok(Resolution::NotModified(headers)),
            Err(err) => err,
        };

        // A dead request is reported as such, not as a download failure
        ctx.check()?;

        let err = if self.report_downloading_errors {
            err.wrap("", None, true)
        } else {
            err
        };

        let Some(fallback) = &self.fallback else {
            return Err(err);
        };

        let status = if self.fallback_status > 0 {
            self.fallback_status
        } else {
            err.status_or_default()
        };

        Ok(Resolution::Fallback {
            image: fallback.detached_copy(),
            status,
            cause: err,
        })
    }

    /// Fetch the source from the primary store, convert it to the cache
    /// format and write it to the derived cache under the normalized key.
    ///
    /// Vector sources are stored unchanged. A failed write is an error even
    /// though the converted image exists; the image is released in that case.
    pub async fn populate_derived_cache(
        &self,
        ctx: &RequestContext,
        reference: &str,
        opts: &DownloadOptions,
        security: &SecurityOptions,
    ) -> Result<Fetched, GatewayError> {
        let key = normalize(reference);
        let source_key = key.strip_prefix(NO_TRANSFORM_PREFIX).unwrap_or(&key);
        if source_key.is_empty() {
            return Err(GatewayError::parsing(format!("Invalid source reference: {reference}")));
        }

        let po = ProcessingOptions {
            format: self.cache_format,
            security: security.clone(),
            ..Default::default()
        };

        let source = match self
            .fetch(ctx, &*self.primary, source_key, opts, &po.security)
            .await
            .map_err(|e| e.wrap("Can't download source image", None, false))?
        {
            Fetched::Image(image) => image,
            not_modified @ Fetched::NotModified(_) => return Ok(not_modified),
        };

        let mut result = if source.format.is_vector() {
            source
        } else {
            self.transformer
                .transform(ctx, source, &po)
                .await
                .map_err(|e| e.wrap("Can't convert source image", None, false))?
        };

        let stored = ctx
            .run(async {
                self.derived
                    .put_object(&key, result.data.clone(), result.format.mime())
                    .await
                    .map_err(|e| GatewayError::upload(e.to_string()))
            })
            .await;

        let etag = match stored {
            Ok(etag) => etag,
            Err(err) => {
                result.release();
                return Err(err.wrap("Can't store derived image", None, false));
            }
        };

        // Later hits are validated against the derived copy, not the source
        match etag {
            Some(etag) => {
                result.headers.insert(ETAG_HEADER.to_string(), etag);
            }
            None => {
                result.headers.remove(ETAG_HEADER);
            }
        }

        info!(
            key = %key,
            format = %result.format,
            bytes = result.len(),
            "Derived cache populated"
        );
        Ok(Fetched::Image(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use imgate_storage::MemoryObjectStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Re-tags the buffer with the requested format without touching pixels
    #[derive(Default)]
    struct RetagTransformer {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transformer for RetagTransformer {
        async fn transform(
            &self,
            _ctx: &RequestContext,
            image: ImageBuffer,
            po: &ProcessingOptions,
        ) -> imgate_common::Result<ImageBuffer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut data = b"converted:".to_vec();
            data.extend_from_slice(&image.data);
            Ok(ImageBuffer::new(po.format, data).with_headers(image.headers.clone()))
        }

        async fn sanitize(&self, image: &ImageBuffer) -> imgate_common::Result<ImageBuffer> {
            Ok(image.detached_copy())
        }

        async fn fix_unsupported(
            &self,
            _image: &ImageBuffer,
        ) -> imgate_common::Result<Option<ImageBuffer>> {
            Ok(None)
        }

        fn supports_load(&self, _format: ImageFormat) -> bool {
            true
        }

        fn supports_save(&self, _format: ImageFormat) -> bool {
            true
        }
    }

    struct Fixture {
        primary: Arc<MemoryObjectStorage>,
        derived: Arc<MemoryObjectStorage>,
        transformer: Arc<RetagTransformer>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                primary: Arc::new(MemoryObjectStorage::new("primary")),
                derived: Arc::new(MemoryObjectStorage::new("derived")),
                transformer: Arc::new(RetagTransformer::default()),
            }
        }

        fn resolver(&self) -> OriginResolver {
            OriginResolver::new(
                self.primary.clone(),
                self.derived.clone(),
                self.transformer.clone(),
                ImageFormat::Webp,
            )
        }
    }

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3];

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("photos/a.jpg"), "0x0/photos/a.jpg");
        assert_eq!(normalize("///photos/a.jpg"), "0x0/photos/a.jpg");
        assert_eq!(normalize("0x0/photos/a.jpg"), "0x0/photos/a.jpg");
        for reference in ["a.jpg", "/a.jpg", "0x0/a.jpg", "/0x0/a.jpg", ""] {
            let once = normalize(reference);
            assert!(once.starts_with(NO_TRANSFORM_PREFIX));
            assert_eq!(normalize(&once), once);
        }
    }

    #[tokio::test]
    async fn test_derived_hit_skips_primary() {
        let fx = Fixture::new();
        fx.derived.insert("0x0/photos/a.jpg", JPEG.to_vec(), "image/jpeg").await;

        let resolution = fx
            .resolver()
            .resolve(
                &RequestContext::new(),
                "photos/a.jpg",
                &DownloadOptions::new(),
                &ProcessingOptions::default(),
            )
            .await
            .unwrap();

        assert!(matches!(resolution, Resolution::Found(ref image) if image.format == ImageFormat::Jpeg));
        assert_eq!(fx.primary.get_count(), 0);
        assert_eq!(fx.transformer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_miss_populates_derived_cache() {
        let fx = Fixture::new();
        fx.primary.insert("photos/a.jpg", JPEG.to_vec(), "image/jpeg").await;
        let resolver = fx.resolver();
        let ctx = RequestContext::new();

        let resolution = resolver
            .resolve(&ctx, "photos/a.jpg", &DownloadOptions::new(), &ProcessingOptions::default())
            .await
            .unwrap();
        let Resolution::Found(image) = resolution else {
            panic!("expected a resolved image");
        };
        assert_eq!(image.format, ImageFormat::Webp);
        assert!(fx.derived.contains("0x0/photos/a.jpg").await);
        assert_eq!(fx.derived.put_count(), 1);
        let miss_etag = image.header(ETAG_HEADER).map(ToString::to_string);

        // Second request is served from the derived cache
        let resolution = resolver
            .resolve(&ctx, "photos/a.jpg", &DownloadOptions::new(), &ProcessingOptions::default())
            .await
            .unwrap();
        let Resolution::Found(image) = resolution else {
            panic!("expected a resolved image");
        };
        assert!(miss_etag.is_some());
        assert_eq!(image.header(ETAG_HEADER).map(ToString::to_string), miss_etag);
        assert_eq!(fx.primary.get_count(), 1);
        assert_eq!(fx.transformer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_populate_strips_prefix_once() {
        let fx = Fixture::new();
        fx.primary.insert("0x0/a.jpg", JPEG.to_vec(), "image/jpeg").await;

        let fetched = fx
            .resolver()
            .populate_derived_cache(
                &RequestContext::new(),
                "/0x0/a.jpg",
                &DownloadOptions::new(),
                &SecurityOptions::default(),
            )
            .await
            .unwrap();

        assert!(matches!(fetched, Fetched::Image(_)));
        assert!(fx.derived.contains("0x0/0x0/a.jpg").await);
    }

    #[tokio::test]
    async fn test_vector_source_is_stored_unchanged() {
        let fx = Fixture::new();
        let svg = b"<svg xmlns=\"http://www.w3.org/2000/svg\"></svg>".to_vec();
        fx.primary.insert("icons/a.svg", svg.clone(), "image/svg+xml").await;

        let fetched = fx
            .resolver()
            .populate_derived_cache(
                &RequestContext::new(),
                "icons/a.svg",
                &DownloadOptions::new(),
                &SecurityOptions::default(),
            )
            .await
            .unwrap();

        let Fetched::Image(image) = fetched else {
            panic!("expected an image");
        };
        assert_eq!(image.format, ImageFormat::Svg);
        assert_eq!(fx.transformer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.derived.data("0x0/icons/a.svg").await, Some(Bytes::from(svg)));
    }

    #[tokio::test]
    async fn test_missing_source_without_fallback() {
        let fx = Fixture::new();
        let err = fx
            .resolver()
            .resolve(
                &RequestContext::new(),
                "nope.jpg",
                &DownloadOptions::new(),
                &ProcessingOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.kind(), ErrorKind::Download);
    }

    #[tokio::test]
    async fn test_fallback_substitution() {
        let fx = Fixture::new();
        let fallback = ImageBuffer::new(ImageFormat::Png, b"fallback".to_vec());

        let resolver = fx.resolver().with_fallback(Some(fallback), 0);
        let resolution = resolver
            .resolve(
                &RequestContext::new(),
                "nope.jpg",
                &DownloadOptions::new(),
                &ProcessingOptions::default(),
            )
            .await
            .unwrap();

        match resolution {
            Resolution::Fallback { image, status, cause } => {
                assert_eq!(&image.data[..], b"fallback");
                assert_eq!(status, 404);
                assert_eq!(cause.status(), Some(404));
            }
            other => panic!("expected fallback, got {other:?}"),
        }

        let resolver = fx
            .resolver()
            .with_fallback(Some(ImageBuffer::new(ImageFormat::Png, b"f".to_vec())), 200);
        let resolution = resolver
            .resolve(
                &RequestContext::new(),
                "nope.jpg",
                &DownloadOptions::new(),
                &ProcessingOptions::default(),
            )
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Fallback { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_store_write_failure_is_an_error() {
        let fx = Fixture::new();
        fx.primary.insert("photos/a.jpg", JPEG.to_vec(), "image/jpeg").await;
        fx.derived.set_unavailable(true);

        let err = fx
            .resolver()
            .populate_derived_cache(
                &RequestContext::new(),
                "photos/a.jpg",
                &DownloadOptions::new(),
                &SecurityOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upload);
        assert!(err.message().starts_with("Can't store derived image"));
        assert_eq!(fx.transformer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conditional_primary_fetch_propagates_not_modified() {
        let fx = Fixture::new();
        fx.primary.insert("photos/a.jpg", JPEG.to_vec(), "image/jpeg").await;
        let opts = DownloadOptions::new()
            .with_header("If-Modified-Since", "Fri, 01 Jan 2100 00:00:00 GMT");

        let resolution = fx
            .resolver()
            .resolve(&RequestContext::new(), "photos/a.jpg", &opts, &ProcessingOptions::default())
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::NotModified(_)));
        assert_eq!(fx.derived.put_count(), 0);
    }

    #[tokio::test]
    async fn test_file_size_limit_applies_to_source() {
        let fx = Fixture::new();
        fx.primary.insert("photos/a.jpg", JPEG.to_vec(), "image/jpeg").await;
        let po = ProcessingOptions {
            security: SecurityOptions {
                max_src_file_size: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };

        let err = fx
            .resolver()
            .resolve(&RequestContext::new(), "photos/a.jpg", &DownloadOptions::new(), &po)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(422));
    }

    #[tokio::test]
    async fn test_cancelled_request_skips_fallback() {
        let fx = Fixture::new();
        let resolver = fx
            .resolver()
            .with_fallback(Some(ImageBuffer::new(ImageFormat::Png, b"f".to_vec())), 200);
        let ctx = RequestContext::new();
        ctx.cancel();

        let err = resolver
            .resolve(&ctx, "photos/a.jpg", &DownloadOptions::new(), &ProcessingOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(fx.derived.get_count(), 0);
    }
}
