//! Fallback image loading
//!
//! The fallback image is loaded once at startup from inline base64 data, a
//! local file or a URL, whichever is configured.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use imgate_common::{ImageBuffer, ImageFormat, FALLBACK_IMAGE_HEADER};
use std::collections::HashMap;
use tracing::info;

use crate::config::Config;

async fn fetch_url(url: &str) -> Result<Bytes> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("Failed to download fallback image from {url}"))?
        .error_for_status()
        .with_context(|| format!("Fallback image URL {url} returned an error status"))?;
    response
        .bytes()
        .await
        .context("Failed to read fallback image body")
}

/// Load the configured fallback image, if any
pub async fn load_fallback_image(config: &Config) -> Result<Option<ImageBuffer>> {
    let (data, source) = if let Some(encoded) = &config.fallback_image_data {
        let decoded = STANDARD
            .decode(encoded.trim())
            .context("fallback_image_data is not valid base64")?;
        (Bytes::from(decoded), "inline data".to_string())
    } else if let Some(path) = &config.fallback_image_path {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read fallback image: {}", path.display()))?;
        (Bytes::from(data), path.display().to_string())
    } else if let Some(url) = &config.fallback_image_url {
        (fetch_url(url).await?, url.clone())
    } else {
        return Ok(None);
    };

    let format = ImageFormat::sniff(&data);
    if format == ImageFormat::Unknown {
        bail!("Fallback image from {source} is not a recognised image format");
    }

    let mut headers = HashMap::new();
    if config.fallback_image_ttl > 0 {
        headers.insert(FALLBACK_IMAGE_HEADER.to_string(), "1".to_string());
    }

    info!(source = %source, format = %format, bytes = data.len(), "Fallback image loaded");
    Ok(Some(ImageBuffer::new(format, data).with_headers(headers)))
}
