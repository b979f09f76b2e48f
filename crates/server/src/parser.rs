//! Request path parsing
//!
//! Paths look like `/<W>x<H>/<source path>[@<ext>]`, e.g. `/300x200/photos/a.jpg@webp`.
//! The path is percent-decoded before it is split, so `my%20cat.jpg` names
//! the object `my cat.jpg`.
//! Query parameters: `raw=1`, `expires=<unix seconds>`, `format=<ext>`.
//! `0` for either dimension keeps the source size.

use axum::extract::Query;
use axum::http::Uri;
use imgate_common::{GatewayError, ImageFormat, ProcessingOptions, SecurityOptions};
use percent_encoding::percent_decode_str;
use serde::Deserialize;

use crate::config::Config;

/// Turns request paths into [`ProcessingOptions`] plus the source reference
#[derive(Debug, Clone)]
pub struct OptionsParser {
    auto_webp: bool,
    enforce_webp: bool,
    auto_avif: bool,
    enforce_avif: bool,
    skip_processing_formats: Vec<ImageFormat>,
    security: SecurityOptions,
}

/// Recognized query parameters; anything else is ignored
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImageQuery {
    raw: Option<String>,
    expires: Option<String>,
    format: Option<String>,
}

fn parse_dimensions(segment: &str) -> Option<(u32, u32)> {
    let (w, h) = segment.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

fn accepts(accept: Option<&str>, mime: &str) -> bool {
    accept.is_some_and(|accept| {
        accept
            .split(',')
            .any(|part| part.split(';').next().is_some_and(|m| m.trim().eq_ignore_ascii_case(mime)))
    })
}

fn parse_format(value: &str) -> Result<ImageFormat, GatewayError> {
    ImageFormat::from_extension(value)
        .ok_or_else(|| GatewayError::parsing(format!("Invalid image format: {value}")))
}

impl OptionsParser {
    pub fn new(config: &Config) -> Self {
        Self {
            auto_webp: config.auto_webp,
            enforce_webp: config.enforce_webp,
            auto_avif: config.auto_avif,
            enforce_avif: config.enforce_avif,
            skip_processing_formats: config.skip_processing_formats.clone(),
            security: config.security.options(),
        }
    }

    /// Parse a request URI.
    ///
    /// Returns the options and the source reference (without dimensions or extension).
    pub fn parse(
        &self,
        uri: &Uri,
        accept: Option<&str>,
    ) -> Result<(ProcessingOptions, String), GatewayError> {
        let decoded = percent_decode_str(uri.path())
            .decode_utf8()
            .map_err(|_| GatewayError::parsing(format!("Invalid path encoding: {}", uri.path())))?;

        let path = decoded.trim_start_matches('/');
        let (dimensions, source) = path
            .split_once('/')
            .ok_or_else(|| GatewayError::parsing(format!("Invalid path: {path}")))?;

        let (width, height) = parse_dimensions(dimensions)
            .ok_or_else(|| GatewayError::parsing(format!("Invalid dimensions: {dimensions}")))?;

        let mut format = ImageFormat::Unknown;
        let source = match source.rsplit_once('@') {
            Some((source, ext)) => {
                format = parse_format(ext)?;
                source
            }
            None => source,
        };

        if source.is_empty() {
            return Err(GatewayError::parsing("Source image reference is empty"));
        }

        let Query(query) = Query::<ImageQuery>::try_from_uri(uri)
            .map_err(|e| GatewayError::parsing(format!("Invalid query: {e}")))?;

        let mut po = ProcessingOptions {
            width,
            height,
            skip_processing_formats: self.skip_processing_formats.clone(),
            security: self.security.clone(),
            raw: query
                .raw
                .as_deref()
                .is_some_and(|v| matches!(v, "1" | "true" | "t")),
            ..Default::default()
        };

        if let Some(value) = query.expires.as_deref() {
            po.expires = Some(
                value
                    .parse()
                    .map_err(|_| GatewayError::parsing(format!("Invalid expires: {value}")))?,
            );
        }
        if let Some(value) = query.format.as_deref() {
            format = parse_format(value)?;
        }

        po.format = self.negotiate(format, accept);
        Ok((po, source.to_string()))
    }

    /// Explicit format, then enforced, then auto-selected from `Accept`
    fn negotiate(&self, explicit: ImageFormat, accept: Option<&str>) -> ImageFormat {
        if explicit != ImageFormat::Unknown {
            return explicit;
        }

        let avif = accepts(accept, "image/avif");
        let webp = accepts(accept, "image/webp");

        if self.enforce_avif && avif {
            ImageFormat::Avif
        } else if self.enforce_webp && webp {
            ImageFormat::Webp
        } else if self.auto_avif && avif {
            ImageFormat::Avif
        } else if self.auto_webp && webp {
            ImageFormat::Webp
        } else {
            ImageFormat::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> OptionsParser {
        OptionsParser::new(&Config::default())
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_dimensions_and_source() {
        let (po, source) = parser().parse(&uri("/300x200/photos/a.jpg"), None).unwrap();
        assert_eq!(po.width, 300);
        assert_eq!(po.height, 200);
        assert_eq!(po.format, ImageFormat::Unknown);
        assert_eq!(source, "photos/a.jpg");
    }

    #[test]
    fn test_parse_extension() {
        let (po, source) = parser().parse(&uri("/0x0/photos/a.jpg@webp"), None).unwrap();
        assert_eq!(po.format, ImageFormat::Webp);
        assert!(!po.resizes());
        assert_eq!(source, "photos/a.jpg");
    }

    #[test]
    fn test_parse_query() {
        let (po, _) = parser()
            .parse(&uri("/0x0/a.png?raw=1&expires=1700000000&format=gif&other=x"), None)
            .unwrap();
        assert!(po.raw);
        assert_eq!(po.expires, Some(1_700_000_000));
        assert_eq!(po.format, ImageFormat::Gif);
    }

    #[test]
    fn test_malformed_paths() {
        for path in ["/", "/photos", "/abc/photos/a.jpg", "/300x/a.jpg", "/0x0/", "/0x0/a.jpg@bogus"] {
            let err = parser().parse(&uri(path), None).unwrap_err();
            assert_eq!(err.status(), Some(404), "path {path}");
        }
    }

    #[test]
    fn test_percent_encoded_path() {
        let (po, source) = parser()
            .parse(&uri("/0x0/photos/my%20cat%C3%A9.jpg@webp"), None)
            .unwrap();
        assert_eq!(source, "photos/my caté.jpg");
        assert_eq!(po.format, ImageFormat::Webp);

        let err = parser().parse(&uri("/0x0/bad%FF.jpg"), None).unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn test_encoded_query_values() {
        let (po, _) = parser()
            .parse(&uri("/0x0/a.jpg?format=%77ebp&raw=%31"), None)
            .unwrap();
        assert_eq!(po.format, ImageFormat::Webp);
        assert!(po.raw);
    }

    #[test]
    fn test_bad_expires() {
        assert!(parser().parse(&uri("/0x0/a.jpg?expires=soon"), None).is_err());
    }

    #[test]
    fn test_auto_format_from_accept() {
        let parser = OptionsParser::new(&Config {
            auto_webp: true,
            auto_avif: true,
            ..Default::default()
        });

        let (po, _) = parser
            .parse(&uri("/0x0/a.jpg"), Some("image/avif,image/webp,*/*;q=0.8"))
            .unwrap();
        assert_eq!(po.format, ImageFormat::Avif);

        let (po, _) = parser.parse(&uri("/0x0/a.jpg"), Some("image/webp")).unwrap();
        assert_eq!(po.format, ImageFormat::Webp);

        let (po, _) = parser.parse(&uri("/0x0/a.jpg"), Some("image/png")).unwrap();
        assert_eq!(po.format, ImageFormat::Unknown);

        // Explicit format wins
        let (po, _) = parser.parse(&uri("/0x0/a.jpg@png"), Some("image/avif")).unwrap();
        assert_eq!(po.format, ImageFormat::Png);
    }

    #[test]
    fn test_enforce_beats_auto() {
        let parser = OptionsParser::new(&Config {
            enforce_webp: true,
            auto_avif: true,
            ..Default::default()
        });
        let (po, _) = parser
            .parse(&uri("/0x0/a.jpg"), Some("image/avif,image/webp"))
            .unwrap();
        assert_eq!(po.format, ImageFormat::Webp);
    }

    #[test]
    fn test_config_limits_are_copied() {
        let mut config = Config::default();
        config.skip_processing_formats = vec![ImageFormat::Gif];
        config.security.max_src_file_size = Some(1024);

        let (po, _) = OptionsParser::new(&config).parse(&uri("/0x0/a.gif"), None).unwrap();
        assert_eq!(po.skip_processing_formats, vec![ImageFormat::Gif]);
        assert_eq!(po.security.max_src_file_size, Some(1024));
    }
}
