//! Administrative derived-cache refresh
//!
//! Re-runs the lazy population path for one reference, bypassing the skip and
//! conditional logic of the image pipeline. Shares the worker gate with image
//! requests but runs under its own deadline and never serves the fallback.

use chrono::{DateTime, Utc};
use imgate_common::{
    DownloadOptions, GatewayError, ImageFormat, RequestContext, RESULT_HEIGHT_HEADER,
    RESULT_WIDTH_HEADER,
};
use thiserror::Error;
use tracing::info;

use crate::gateway::Gateway;
use crate::resolver::{normalize, Fetched};

/// Metadata of a freshly written derived-cache entry
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshResult {
    /// Reference as given by the caller
    pub path: String,
    /// Derived-cache key that was written
    pub master_key: String,
    pub format: ImageFormat,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bytes: usize,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("query param 'path' is required")]
    MissingPath,

    /// No worker slot before the caller gave up
    #[error("timeout acquiring worker")]
    Worker(GatewayError),

    #[error("{0}")]
    Failed(GatewayError),
}

impl RefreshError {
    pub fn status(&self) -> u16 {
        match self {
            Self::MissingPath => 400,
            Self::Worker(_) => 504,
            Self::Failed(err) => err.status_or_default(),
        }
    }

    pub fn cause(&self) -> Option<&GatewayError> {
        match self {
            Self::MissingPath => None,
            Self::Worker(err) | Self::Failed(err) => Some(err),
        }
    }
}

fn dimension(value: Option<&str>) -> Option<u32> {
    value.and_then(|v| v.parse().ok())
}

impl Gateway {
    /// Rebuild the derived-cache entry for `reference`.
    ///
    /// The worker slot is awaited under `ctx`; the rebuild itself runs under
    /// the refresh deadline.
    pub async fn refresh_derived_cache(
        &self,
        ctx: &RequestContext,
        reference: &str,
    ) -> Result<RefreshResult, RefreshError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RefreshError::MissingPath);
        }

        let _worker = self
            .gate
            .acquire_worker(ctx)
            .await
            .map_err(RefreshError::Worker)?;

        let ctx = ctx.child_with_timeout(self.config.refresh_timeout());

        let master_key = normalize(reference);
        let fetched = self
            .resolver
            .populate_derived_cache(
                &ctx,
                &master_key,
                &DownloadOptions::new(),
                &self.config.security.options(),
            )
            .await
            .map_err(RefreshError::Failed)?;

        let image = match fetched {
            Fetched::Image(image) => image,
            Fetched::NotModified(_) => {
                return Err(RefreshError::Failed(GatewayError::internal(
                    "Unconditional fetch reported not modified",
                )))
            }
        };

        let result = RefreshResult {
            path: reference.to_string(),
            master_key,
            format: image.format,
            width: dimension(image.header(RESULT_WIDTH_HEADER)),
            height: dimension(image.header(RESULT_HEIGHT_HEADER)),
            bytes: image.len(),
            processed_at: Utc::now(),
        };
        image.release();

        info!(
            path = %result.path,
            master_key = %result.master_key,
            format = %result.format,
            bytes = result.bytes,
            "Derived cache refreshed"
        );
        Ok(result)
    }
}
