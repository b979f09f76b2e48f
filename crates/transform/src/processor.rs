//! `image`-crate backed transformer

use crate::{svg, TransformError, Transformer};
use bytes::Bytes;
use image::imageops::FilterType;
use image::DynamicImage;
use imgate_common::{
    GatewayError, ImageBuffer, ImageFormat, ProcessingOptions, RequestContext,
    ORIGIN_HEIGHT_HEADER, ORIGIN_WIDTH_HEADER, RESULT_HEIGHT_HEADER, RESULT_WIDTH_HEADER,
};
use std::io::Cursor;
use tracing::debug;

/// Encoder settings
#[derive(Debug, Clone, Copy)]
pub struct TransformerConfig {
    /// Quality used when the request doesn't specify one (1-100)
    pub quality: u8,
    /// AVIF encoder speed (1 slowest, 10 fastest)
    pub avif_speed: u8,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            quality: 80,
            avif_speed: 8,
        }
    }
}

impl TransformerConfig {
    fn clamped(self) -> Self {
        Self {
            quality: self.quality.clamp(1, 100),
            avif_speed: self.avif_speed.clamp(1, 10),
        }
    }
}

/// Transformer built on the `image` crate
#[derive(Debug, Clone, Default)]
pub struct ImageTransformer {
    config: TransformerConfig,
}

impl ImageTransformer {
    pub fn new(config: TransformerConfig) -> Self {
        Self { config }
    }
}

struct Processed {
    data: Vec<u8>,
    origin: (u32, u32),
    result: (u32, u32),
}

fn codec_format(format: ImageFormat) -> Option<image::ImageFormat> {
    let format = match format {
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Webp => image::ImageFormat::WebP,
        ImageFormat::Gif => image::ImageFormat::Gif,
        ImageFormat::Avif => image::ImageFormat::Avif,
        ImageFormat::Bmp => image::ImageFormat::Bmp,
        ImageFormat::Tiff => image::ImageFormat::Tiff,
        ImageFormat::Ico => image::ImageFormat::Ico,
        ImageFormat::Heic | ImageFormat::Svg | ImageFormat::Unknown => return None,
    };
    Some(format)
}

/// Fit `(width, height)` into the requested box, keeping the aspect ratio.
/// A zero side is derived from the other one. Never enlarges.
fn target_dimensions(src: (u32, u32), width: u32, height: u32) -> (u32, u32) {
    let (src_w, src_h) = src;
    if src_w == 0 || src_h == 0 {
        return src;
    }

    let scale_w = f64::from(width) / f64::from(src_w);
    let scale_h = f64::from(height) / f64::from(src_h);
    let scale = match (width, height) {
        (0, 0) => 1.0,
        (_, 0) => scale_w,
        (0, _) => scale_h,
        _ => scale_w.min(scale_h),
    };

    if scale >= 1.0 {
        return src;
    }

    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).max(1);
    (scaled(src_w), scaled(src_h))
}

fn encode(
    image: &DynamicImage,
    format: ImageFormat,
    quality: u8,
    avif_speed: u8,
) -> Result<Vec<u8>, TransformError> {
    let mut cursor = Cursor::new(Vec::new());
    let encode_err = |e: image::ImageError| TransformError::Encode(e.to_string());

    match format {
        ImageFormat::Jpeg => {
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality);
            DynamicImage::ImageRgb8(image.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(encode_err)?;
        }
        ImageFormat::Avif => {
            let encoder =
                image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut cursor, avif_speed, quality);
            DynamicImage::ImageRgba8(image.to_rgba8())
                .write_with_encoder(encoder)
                .map_err(encode_err)?;
        }
        other => {
            let codec = codec_format(other).ok_or(TransformError::UnsupportedSave(other))?;
            DynamicImage::ImageRgba8(image.to_rgba8())
                .write_to(&mut cursor, codec)
                .map_err(encode_err)?;
        }
    }

    Ok(cursor.into_inner())
}

fn process(
    data: &[u8],
    source: ImageFormat,
    target: ImageFormat,
    po: &ProcessingOptions,
    config: TransformerConfig,
) -> Result<Processed, TransformError> {
    let codec = codec_format(source).ok_or(TransformError::UnsupportedLoad(source))?;
    let image = image::load_from_memory_with_format(data, codec)
        .map_err(|e| TransformError::Decode(e.to_string()))?;

    let origin = (image.width(), image.height());

    if let Some(limit) = po.security.max_src_resolution {
        let megapixels = f64::from(origin.0) * f64::from(origin.1) / 1_000_000.0;
        if megapixels > limit {
            return Err(TransformError::ResolutionTooLarge { megapixels, limit });
        }
    }

    let result = target_dimensions(origin, po.width, po.height);
    let image = if result == origin {
        image
    } else {
        image.resize_exact(result.0, result.1, FilterType::Lanczos3)
    };

    let quality = if po.quality == 0 {
        config.quality
    } else {
        po.quality.clamp(1, 100)
    };

    let data = encode(&image, target, quality, config.avif_speed)?;

    Ok(Processed {
        data,
        origin,
        result,
    })
}

#[async_trait::async_trait]
impl Transformer for ImageTransformer {
    async fn transform(
        &self,
        ctx: &RequestContext,
        image: ImageBuffer,
        po: &ProcessingOptions,
    ) -> imgate_common::Result<ImageBuffer> {
        ctx.check()?;

        let source = match image.format {
            ImageFormat::Unknown => ImageFormat::sniff(&image.data),
            format => format,
        };
        let target = match po.format {
            ImageFormat::Unknown => source,
            format => format,
        };

        if !self.supports_save(target) {
            return Err(TransformError::UnsupportedSave(target).into());
        }

        // Same format, same size and no quality override: nothing to do,
        // which also lets undecodable formats (AVIF) pass through.
        if target == source && !po.resizes() && po.quality == 0 && !self.supports_load(source) {
            debug!("Passing {} image through untouched", source);
            return Ok(image);
        }

        if !self.supports_load(source) {
            return Err(TransformError::UnsupportedLoad(source).into());
        }

        let data = image.data.clone();
        let options = po.clone();
        let config = self.config.clamped();

        let processed = ctx
            .run(async move {
                match tokio::task::spawn_blocking(move || {
                    process(&data, source, target, &options, config)
                })
                .await
                {
                    Ok(result) => result.map_err(GatewayError::from),
                    Err(e) => Err(TransformError::Join(e.to_string()).into()),
                }
            })
            .await?;

        debug!(
            "Transformed {}x{} {} into {}x{} {} ({} bytes)",
            processed.origin.0,
            processed.origin.1,
            source,
            processed.result.0,
            processed.result.1,
            target,
            processed.data.len()
        );

        let mut headers = image.headers.clone();
        headers.insert(ORIGIN_WIDTH_HEADER.to_string(), processed.origin.0.to_string());
        headers.insert(ORIGIN_HEIGHT_HEADER.to_string(), processed.origin.1.to_string());
        headers.insert(RESULT_WIDTH_HEADER.to_string(), processed.result.0.to_string());
        headers.insert(RESULT_HEIGHT_HEADER.to_string(), processed.result.1.to_string());

        // The source is superseded by the result
        image.release();

        Ok(ImageBuffer::new(target, Bytes::from(processed.data)).with_headers(headers))
    }

    async fn sanitize(&self, image: &ImageBuffer) -> imgate_common::Result<ImageBuffer> {
        let data = svg::sanitize(&image.data)?;
        Ok(ImageBuffer::new(ImageFormat::Svg, data).with_headers(image.headers.clone()))
    }

    async fn fix_unsupported(
        &self,
        image: &ImageBuffer,
    ) -> imgate_common::Result<Option<ImageBuffer>> {
        let fixed = svg::fix_unsupported(&image.data)?;
        Ok(fixed.map(|data| {
            ImageBuffer::new(ImageFormat::Svg, data).with_headers(image.headers.clone())
        }))
    }

    fn supports_load(&self, format: ImageFormat) -> bool {
        matches!(
            format,
            ImageFormat::Jpeg
                | ImageFormat::Png
                | ImageFormat::Webp
                | ImageFormat::Gif
                | ImageFormat::Bmp
                | ImageFormat::Tiff
                | ImageFormat::Ico
        )
    }

    fn supports_save(&self, format: ImageFormat) -> bool {
        self.supports_load(format) || format == ImageFormat::Avif
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use imgate_common::{SecurityOptions, ETAG_HEADER};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut cursor, image::ImageFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_target_dimensions() {
        assert_eq!(target_dimensions((400, 200), 0, 0), (400, 200));
        assert_eq!(target_dimensions((400, 200), 100, 0), (100, 50));
        assert_eq!(target_dimensions((400, 200), 0, 50), (100, 50));
        assert_eq!(target_dimensions((400, 200), 100, 100), (100, 50));
        // Never enlarges
        assert_eq!(target_dimensions((400, 200), 800, 0), (400, 200));
    }

    #[tokio::test]
    async fn test_resize_and_convert() {
        let transformer = ImageTransformer::default();
        let mut headers = HashMap::new();
        headers.insert(ETAG_HEADER.to_string(), "\"origin\"".to_string());
        let source = ImageBuffer::new(ImageFormat::Png, png_bytes(64, 32)).with_headers(headers);

        let po = ProcessingOptions {
            width: 16,
            format: ImageFormat::Jpeg,
            ..Default::default()
        };

        let result = transformer
            .transform(&RequestContext::new(), source, &po)
            .await
            .unwrap();

        assert_eq!(result.format, ImageFormat::Jpeg);
        assert_eq!(ImageFormat::sniff(&result.data), ImageFormat::Jpeg);
        assert_eq!(result.header(RESULT_WIDTH_HEADER), Some("16"));
        assert_eq!(result.header(RESULT_HEIGHT_HEADER), Some("8"));
        assert_eq!(result.header(ORIGIN_WIDTH_HEADER), Some("64"));
        assert_eq!(result.header(ETAG_HEADER), Some("\"origin\""));
    }

    #[tokio::test]
    async fn test_source_is_released() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let source = ImageBuffer::new(ImageFormat::Png, png_bytes(8, 8)).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = ImageTransformer::default()
            .transform(
                &RequestContext::new(),
                source,
                &ProcessingOptions::convert_to(ImageFormat::Gif),
            )
            .await
            .unwrap();

        assert_eq!(result.format, ImageFormat::Gif);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolution_limit() {
        let source = ImageBuffer::new(ImageFormat::Png, png_bytes(100, 100));
        let po = ProcessingOptions {
            security: SecurityOptions {
                max_src_resolution: Some(0.001),
                ..Default::default()
            },
            ..Default::default()
        };

        let err = ImageTransformer::default()
            .transform(&RequestContext::new(), source, &po)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(422));
    }

    #[tokio::test]
    async fn test_unloadable_same_format_passes_through() {
        let source = ImageBuffer::new(ImageFormat::Avif, b"opaque avif".to_vec());
        let result = ImageTransformer::default()
            .transform(
                &RequestContext::new(),
                source,
                &ProcessingOptions::convert_to(ImageFormat::Avif),
            )
            .await
            .unwrap();
        assert_eq!(&result.data[..], b"opaque avif");
    }

    #[tokio::test]
    async fn test_unsupported_source_rejected() {
        let source = ImageBuffer::new(ImageFormat::Heic, b"heic".to_vec());
        let err = ImageTransformer::default()
            .transform(
                &RequestContext::new(),
                source,
                &ProcessingOptions::convert_to(ImageFormat::Png),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(422));
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let ctx = RequestContext::new();
        ctx.cancel();

        let source = ImageBuffer::new(ImageFormat::Png, png_bytes(8, 8));
        let err = ImageTransformer::default()
            .transform(&ctx, source, &ProcessingOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_sanitize_keeps_headers() {
        let mut headers = HashMap::new();
        headers.insert(ETAG_HEADER.to_string(), "\"svg\"".to_string());
        let source = ImageBuffer::new(
            ImageFormat::Svg,
            br#"<svg onload="x()"><rect/></svg>"#.to_vec(),
        )
        .with_headers(headers);

        let clean = ImageTransformer::default().sanitize(&source).await.unwrap();
        assert_eq!(&clean.data[..], b"<svg><rect/></svg>");
        assert_eq!(clean.header(ETAG_HEADER), Some("\"svg\""));
    }

    #[test]
    fn test_supported_formats() {
        let transformer = ImageTransformer::default();
        assert!(transformer.supports_load(ImageFormat::Jpeg));
        assert!(!transformer.supports_load(ImageFormat::Svg));
        assert!(!transformer.supports_load(ImageFormat::Avif));
        assert!(transformer.supports_save(ImageFormat::Avif));
        assert!(!transformer.supports_save(ImageFormat::Heic));
    }
}
