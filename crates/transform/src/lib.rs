//! Transform capability for the image gateway
//!
//! The request pipeline only sees the [`Transformer`] trait:
//! - `transform`: decode, resize and re-encode a buffer according to [`ProcessingOptions`]
//! - `sanitize`: strip active content from SVG documents
//! - `fix_unsupported`: rewrite SVG features the rasterizer can't handle
//!
//! [`ImageTransformer`] implements it on top of the `image` crate. Decoding and
//! encoding are CPU-bound and run on the blocking pool.
//!
//! # Example
//! ```no_run
//! use imgate_common::{ImageBuffer, ImageFormat, ProcessingOptions, RequestContext};
//! use imgate_transform::{ImageTransformer, Transformer};
//!
//! # async fn demo(bytes: Vec<u8>) -> imgate_common::Result<()> {
//! let transformer = ImageTransformer::default();
//! let source = ImageBuffer::new(ImageFormat::Jpeg, bytes);
//! let po = ProcessingOptions {
//!     width: 300,
//!     format: ImageFormat::Png,
//!     ..Default::default()
//! };
//!
//! let result = transformer.transform(&RequestContext::new(), source, &po).await?;
//! assert_eq!(result.format, ImageFormat::Png);
//! # Ok(())
//! # }
//! ```

pub mod processor;
pub mod svg;

pub use processor::{ImageTransformer, TransformerConfig};

use imgate_common::{
    GatewayError, ImageBuffer, ImageFormat, ProcessingOptions, RequestContext,
};
use thiserror::Error;

/// Errors specific to image transformation
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Can't load {0} images")]
    UnsupportedLoad(ImageFormat),

    #[error("Can't save {0} images")]
    UnsupportedSave(ImageFormat),

    #[error("Source image resolution {megapixels:.1}MP exceeds the {limit:.1}MP limit")]
    ResolutionTooLarge { megapixels: f64, limit: f64 },

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("SVG document is not valid UTF-8")]
    InvalidSvg,

    #[error("Malformed SVG document: {0}")]
    MalformedSvg(String),

    #[error("Transform task failed: {0}")]
    Join(String),
}

impl From<TransformError> for GatewayError {
    fn from(err: TransformError) -> Self {
        let message = err.to_string();
        match err {
            TransformError::UnsupportedLoad(_)
            | TransformError::UnsupportedSave(_)
            | TransformError::ResolutionTooLarge { .. } => {
                GatewayError::unsupported_format(message)
            }
            TransformError::Decode(_)
            | TransformError::InvalidSvg
            | TransformError::MalformedSvg(_) => {
                GatewayError::transform(message).with_status(422)
            }
            TransformError::Encode(_) => GatewayError::transform(message),
            TransformError::Join(_) => GatewayError::internal(message),
        }
    }
}

/// Transform capability used by the request pipeline and the refresh endpoint
#[async_trait::async_trait]
pub trait Transformer: Send + Sync {
    /// Produce a new buffer from `image` according to `po`.
    ///
    /// Takes ownership of the source; it is released once the result exists
    /// (or on failure). Implementations must give up promptly when `ctx` is
    /// cancelled or its deadline passes.
    async fn transform(
        &self,
        ctx: &RequestContext,
        image: ImageBuffer,
        po: &ProcessingOptions,
    ) -> imgate_common::Result<ImageBuffer>;

    /// Sanitized copy of an SVG buffer
    async fn sanitize(&self, image: &ImageBuffer) -> imgate_common::Result<ImageBuffer>;

    /// Rewrite unsupported vector features. `None` means nothing changed.
    async fn fix_unsupported(
        &self,
        image: &ImageBuffer,
    ) -> imgate_common::Result<Option<ImageBuffer>>;

    /// Whether `format` can be decoded
    fn supports_load(&self, format: ImageFormat) -> bool;

    /// Whether `format` can be encoded
    fn supports_save(&self, format: ImageFormat) -> bool;
}
