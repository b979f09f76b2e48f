//! Image format tags, MIME mapping and content sniffing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Image container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Not known / not requested
    #[default]
    Unknown,
    Jpeg,
    Png,
    Webp,
    Gif,
    Avif,
    Bmp,
    Tiff,
    Ico,
    Heic,
    Svg,
}

impl ImageFormat {
    /// Canonical short name, also used as the file extension
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Avif => "avif",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
            Self::Ico => "ico",
            Self::Heic => "heic",
            Self::Svg => "svg",
        }
    }

    /// MIME type sent as `Content-Type`
    #[must_use]
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Unknown => "application/octet-stream",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Gif => "image/gif",
            Self::Avif => "image/avif",
            Self::Bmp => "image/bmp",
            Self::Tiff => "image/tiff",
            Self::Ico => "image/x-icon",
            Self::Heic => "image/heif",
            Self::Svg => "image/svg+xml",
        }
    }

    /// Vector formats can't be rasterized deterministically by the transformer
    #[must_use]
    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Svg)
    }

    /// Parse an extension or format name (`jpg`, `JPEG`, `webp`, ...)
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        let format = match ext.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            "png" => Self::Png,
            "webp" => Self::Webp,
            "gif" => Self::Gif,
            "avif" => Self::Avif,
            "bmp" => Self::Bmp,
            "tif" | "tiff" => Self::Tiff,
            "ico" => Self::Ico,
            "heic" | "heif" => Self::Heic,
            "svg" => Self::Svg,
            _ => return None,
        };
        Some(format)
    }

    /// Map a `Content-Type` header value to a format
    #[must_use]
    pub fn from_mime(content_type: &str) -> Option<Self> {
        // Remove any parameters (e.g., "image/svg+xml; charset=utf-8" -> "image/svg+xml")
        let mime_type = content_type.split(';').next()?.trim();

        match mime_type.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::Webp),
            "image/gif" => Some(Self::Gif),
            "image/avif" => Some(Self::Avif),
            "image/bmp" | "image/x-ms-bmp" => Some(Self::Bmp),
            "image/tiff" => Some(Self::Tiff),
            "image/x-icon" | "image/vnd.microsoft.icon" => Some(Self::Ico),
            "image/heif" | "image/heic" => Some(Self::Heic),
            "image/svg+xml" => Some(Self::Svg),
            _ => None,
        }
    }

    /// Detect the format from the leading bytes of an object
    #[must_use]
    pub fn sniff(data: &[u8]) -> Self {
        match data {
            [0xFF, 0xD8, 0xFF, ..] => return Self::Jpeg,
            [0x89, b'P', b'N', b'G', ..] => return Self::Png,
            [b'G', b'I', b'F', b'8', ..] => return Self::Gif,
            [b'B', b'M', ..] => return Self::Bmp,
            [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => return Self::Tiff,
            [0x00, 0x00, 0x01, 0x00, ..] => return Self::Ico,
            _ => {}
        }

        if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            return Self::Webp;
        }

        if data.len() >= 12 && &data[4..8] == b"ftyp" {
            match &data[8..12] {
                b"avif" | b"avis" => return Self::Avif,
                b"heic" | b"heix" | b"mif1" | b"msf1" => return Self::Heic,
                _ => {}
            }
        }

        if looks_like_svg(data) {
            return Self::Svg;
        }

        Self::Unknown
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn looks_like_svg(data: &[u8]) -> bool {
    let head = &data[..data.len().min(1024)];
    let Ok(text) = std::str::from_utf8(head) else {
        return false;
    };
    let text = text.trim_start_matches('\u{feff}').trim_start();
    if text.starts_with("<svg") {
        return true;
    }
    (text.starts_with("<?xml") || text.starts_with("<!DOCTYPE") || text.starts_with("<!--"))
        && text.contains("<svg")
}
