//! Conditional responses: ETag negotiation and freshness headers
//!
//! The ETag sent to clients has two halves, `"<options>/<image>"`:
//! - `<options>` is a hash of the Processing Options, so changing the requested
//!   transformation invalidates a cached copy even when the source is unchanged
//! - `<image>` is `R<origin ETag>` when the store supplied a validator, or
//!   `D<data hash>` otherwise (both base64url)
//!
//! A client's `If-None-Match` is parsed before resolution so the origin ETag can
//! be forwarded to the store; the actual token is computed once the image is in
//! hand.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use imgate_common::{
    ImageBuffer, ProcessingOptions, CACHE_CONTROL_HEADER, ETAG_HEADER, EXPIRES_HEADER,
    FALLBACK_IMAGE_HEADER, LAST_MODIFIED_HEADER,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::config::Config;

const HASH_LEN: usize = 12;

/// `Date`-style HTTP timestamp
pub(crate) fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn short_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    URL_SAFE_NO_PAD.encode(&digest[..HASH_LEN])
}

fn options_hash(po: &ProcessingOptions) -> String {
    short_hash(&serde_json::to_vec(po).unwrap_or_default())
}

/// Strip the weak prefix and surrounding quotes
fn unquote(etag: &str) -> &str {
    let etag = etag.trim();
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    etag.trim_matches('"')
}

#[derive(Debug, Default)]
pub struct EtagHandler {
    po_hash_expected: Option<String>,
    img_etag_expected: Option<String>,
    img_hash_expected: Option<String>,

    po_hash_actual: Option<String>,
    img_etag_actual: Option<String>,
    img_hash_actual: Option<String>,
    image_matches: bool,
}

impl EtagHandler {
    /// Parse the client's `If-None-Match`. Unparseable tokens are ignored.
    pub fn parse_expected(&mut self, header: &str) {
        let Some((po_part, img_part)) = header
            .split(',')
            .map(unquote)
            .find_map(|token| token.split_once('/'))
        else {
            return;
        };

        if po_part.is_empty() || img_part.len() < 2 {
            return;
        }

        let (kind, value) = img_part.split_at(1);
        match kind {
            "R" => match URL_SAFE_NO_PAD.decode(value) {
                Ok(decoded) => match String::from_utf8(decoded) {
                    Ok(etag) => self.img_etag_expected = Some(etag),
                    Err(_) => return,
                },
                Err(_) => return,
            },
            "D" => self.img_hash_expected = Some(value.to_string()),
            _ => return,
        }

        self.po_hash_expected = Some(po_part.to_string());
    }

    /// Record the requested options. True when they match the client's token.
    pub fn set_actual_processing_options(&mut self, po: &ProcessingOptions) -> bool {
        self.po_hash_actual = Some(options_hash(po));
        self.processing_options_match()
    }

    pub fn processing_options_match(&self) -> bool {
        self.po_hash_actual.is_some() && self.po_hash_actual == self.po_hash_expected
    }

    /// Origin ETag the client last saw, if its token carried one
    pub fn image_etag_expected(&self) -> Option<&str> {
        self.img_etag_expected.as_deref()
    }

    /// Record the resolved image. True when it is the image the client has.
    pub fn set_actual_image_data(&mut self, image: &ImageBuffer) -> bool {
        self.img_etag_actual = None;
        self.img_hash_actual = None;

        self.image_matches = match image.header(ETAG_HEADER).filter(|e| !e.is_empty()) {
            Some(etag) => {
                self.img_etag_actual = Some(etag.to_string());
                self.img_etag_expected.as_deref() == Some(etag)
            }
            None => {
                let hash = short_hash(&image.data);
                let matches = self.img_hash_expected.as_deref() == Some(hash.as_str());
                self.img_hash_actual = Some(hash);
                matches
            }
        };
        self.image_matches
    }

    /// Both halves match: the client already has this exact response
    pub fn matches(&self) -> bool {
        self.image_matches && self.processing_options_match()
    }

    fn build(po_hash: &str, img_etag: Option<&str>, img_hash: Option<&str>) -> Option<String> {
        let img_part = match (img_etag, img_hash) {
            (Some(etag), _) => format!("R{}", URL_SAFE_NO_PAD.encode(etag)),
            (None, Some(hash)) => format!("D{hash}"),
            (None, None) => return None,
        };
        Some(format!("\"{po_hash}/{img_part}\""))
    }

    /// Token for the response being sent
    pub fn generate_actual(&self) -> Option<String> {
        Self::build(
            self.po_hash_actual.as_deref()?,
            self.img_etag_actual.as_deref(),
            self.img_hash_actual.as_deref(),
        )
    }

    /// Echo of the client's token, used for 304s decided by the store
    pub fn generate_expected(&self) -> Option<String> {
        Self::build(
            self.po_hash_expected.as_deref()?,
            self.img_etag_expected.as_deref(),
            self.img_hash_expected.as_deref(),
        )
    }
}

/// `Cache-Control` and `Expires` for one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Freshness {
    pub cache_control: String,
    pub expires: Option<String>,
}

/// Freshness, `Last-Modified` and `Vary` rules taken from configuration
#[derive(Debug, Clone)]
pub struct CachePolicy {
    ttl: i64,
    fallback_ttl: i64,
    passthrough: bool,
    last_modified_enabled: bool,
    vary: Option<String>,
}

impl CachePolicy {
    pub fn new(config: &Config) -> Self {
        let mut vary = Vec::new();
        if config.auto_webp || config.enforce_webp || config.auto_avif || config.enforce_avif {
            vary.push("Accept");
        }
        if config.enable_client_hints {
            vary.extend(["Sec-CH-DPR", "DPR", "Sec-CH-Width", "Width"]);
        }

        Self {
            ttl: config.ttl,
            fallback_ttl: config.fallback_image_ttl,
            passthrough: config.cache_control_passthrough,
            last_modified_enabled: config.last_modified_enabled,
            vary: (!vary.is_empty()).then(|| vary.join(", ")),
        }
    }

    /// Pick the TTL by precedence: fallback override, per-request expiry,
    /// origin passthrough, global default
    pub fn freshness(
        &self,
        expires: Option<i64>,
        origin: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Freshness {
        let mut ttl: Option<i64> = None;

        if origin.contains_key(FALLBACK_IMAGE_HEADER) && self.fallback_ttl > 0 {
            ttl = Some(self.fallback_ttl);
        }

        if let Some(force) = expires {
            let until = force - now.timestamp();
            if ttl.map_or(true, |t| until < t) {
                ttl = Some(self.ttl.min(until.max(0)));
            }
        }

        if self.passthrough && ttl.is_none() {
            if let Some(cache_control) = origin.get(CACHE_CONTROL_HEADER).filter(|v| !v.is_empty()) {
                return Freshness {
                    cache_control: cache_control.clone(),
                    expires: origin.get(EXPIRES_HEADER).filter(|v| !v.is_empty()).cloned(),
                };
            }

            if let Some(at) = origin
                .get(EXPIRES_HEADER)
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            {
                ttl = Some((at.timestamp() - now.timestamp()).max(0));
            }
        }

        let ttl = ttl.unwrap_or(self.ttl);
        if ttl > 0 {
            Freshness {
                cache_control: format!("max-age={ttl}, public"),
                expires: Some(http_date(now + ChronoDuration::seconds(ttl))),
            }
        } else {
            Freshness {
                cache_control: "no-cache".to_string(),
                expires: None,
            }
        }
    }

    /// Origin `Last-Modified`, when passthrough is enabled
    pub fn last_modified<'a>(&self, origin: &'a HashMap<String, String>) -> Option<&'a str> {
        if !self.last_modified_enabled {
            return None;
        }
        origin
            .get(LAST_MODIFIED_HEADER)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn vary(&self) -> Option<&str> {
        self.vary.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use imgate_common::ImageFormat;

    fn image_with_etag(etag: Option<&str>, data: &'static [u8]) -> ImageBuffer {
        let mut headers = HashMap::new();
        if let Some(etag) = etag {
            headers.insert(ETAG_HEADER.to_string(), etag.to_string());
        }
        ImageBuffer::new(ImageFormat::Jpeg, data).with_headers(headers)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_etag_round_trip_matches() {
        let po = ProcessingOptions::convert_to(ImageFormat::Webp);

        let mut first = EtagHandler::default();
        first.set_actual_processing_options(&po);
        first.set_actual_image_data(&image_with_etag(Some("\"abc\""), b"x"));
        let token = first.generate_actual().unwrap();

        let mut second = EtagHandler::default();
        second.parse_expected(&token);
        assert!(second.set_actual_processing_options(&po));
        assert_eq!(second.image_etag_expected(), Some("\"abc\""));
        assert!(second.set_actual_image_data(&image_with_etag(Some("\"abc\""), b"x")));
        assert!(second.matches());
        assert_eq!(second.generate_expected().as_deref(), Some(token.as_str()));
    }

    #[test]
    fn test_weak_etag_is_accepted() {
        let po = ProcessingOptions::default();
        let mut first = EtagHandler::default();
        first.set_actual_processing_options(&po);
        first.set_actual_image_data(&image_with_etag(None, b"data"));
        let token = first.generate_actual().unwrap();
        assert!(token.contains("/D"));

        let mut second = EtagHandler::default();
        second.parse_expected(&format!("W/{token}"));
        second.set_actual_processing_options(&po);
        assert!(second.set_actual_image_data(&image_with_etag(None, b"data")));
        assert!(second.matches());
    }

    #[test]
    fn test_changed_options_do_not_match() {
        let mut first = EtagHandler::default();
        first.set_actual_processing_options(&ProcessingOptions::convert_to(ImageFormat::Webp));
        first.set_actual_image_data(&image_with_etag(Some("\"abc\""), b"x"));
        let token = first.generate_actual().unwrap();

        let mut second = EtagHandler::default();
        second.parse_expected(&token);
        assert!(!second.set_actual_processing_options(&ProcessingOptions::convert_to(ImageFormat::Png)));
        assert!(second.set_actual_image_data(&image_with_etag(Some("\"abc\""), b"x")));
        assert!(!second.matches());
    }

    #[test]
    fn test_changed_image_does_not_match() {
        let po = ProcessingOptions::default();
        let mut first = EtagHandler::default();
        first.set_actual_processing_options(&po);
        first.set_actual_image_data(&image_with_etag(None, b"one"));
        let token = first.generate_actual().unwrap();

        let mut second = EtagHandler::default();
        second.parse_expected(&token);
        second.set_actual_processing_options(&po);
        assert!(!second.set_actual_image_data(&image_with_etag(None, b"two")));
        assert!(!second.matches());
    }

    #[test]
    fn test_garbage_if_none_match_is_ignored() {
        let mut handler = EtagHandler::default();
        handler.parse_expected("\"not-ours\"");
        handler.parse_expected("\"abc/Xzzz\"");
        assert!(!handler.set_actual_processing_options(&ProcessingOptions::default()));
        assert_eq!(handler.image_etag_expected(), None);
        assert_eq!(handler.generate_expected(), None);
    }

    fn policy(config: Config) -> CachePolicy {
        CachePolicy::new(&config)
    }

    #[test]
    fn test_default_ttl() {
        let freshness = policy(Config::default()).freshness(None, &HashMap::new(), now());
        assert_eq!(freshness.cache_control, "max-age=31536000, public");
        assert_eq!(freshness.expires.as_deref(), Some("Tue, 31 Dec 2024 00:00:00 GMT"));
    }

    #[test]
    fn test_fallback_ttl_wins() {
        let policy = policy(Config {
            fallback_image_ttl: 30,
            ..Default::default()
        });
        let mut origin = HashMap::new();
        origin.insert(FALLBACK_IMAGE_HEADER.to_string(), "1".to_string());

        let freshness = policy.freshness(None, &origin, now());
        assert_eq!(freshness.cache_control, "max-age=30, public");

        // An expiry hint earlier than the fallback TTL still shortens it
        let freshness = policy.freshness(Some(now().timestamp() + 10), &origin, now());
        assert_eq!(freshness.cache_control, "max-age=10, public");
    }

    #[test]
    fn test_expires_hint_is_clamped() {
        let policy = policy(Config {
            ttl: 100,
            ..Default::default()
        });

        let far = policy.freshness(Some(now().timestamp() + 1_000), &HashMap::new(), now());
        assert_eq!(far.cache_control, "max-age=100, public");

        let past = policy.freshness(Some(now().timestamp() - 5), &HashMap::new(), now());
        assert_eq!(past.cache_control, "no-cache");
        assert_eq!(past.expires, None);
    }

    #[test]
    fn test_origin_passthrough() {
        let policy = policy(Config {
            cache_control_passthrough: true,
            ..Default::default()
        });

        let mut origin = HashMap::new();
        origin.insert(CACHE_CONTROL_HEADER.to_string(), "max-age=5, private".to_string());
        assert_eq!(
            policy.freshness(None, &origin, now()).cache_control,
            "max-age=5, private"
        );

        let mut origin = HashMap::new();
        origin.insert(EXPIRES_HEADER.to_string(), "Mon, 01 Jan 2024 00:01:00 GMT".to_string());
        assert_eq!(
            policy.freshness(None, &origin, now()).cache_control,
            "max-age=60, public"
        );
    }

    #[test]
    fn test_passthrough_disabled_ignores_origin() {
        let mut origin = HashMap::new();
        origin.insert(CACHE_CONTROL_HEADER.to_string(), "no-store".to_string());
        let freshness = policy(Config::default()).freshness(None, &origin, now());
        assert_eq!(freshness.cache_control, "max-age=31536000, public");
    }

    #[test]
    fn test_zero_ttl_disables_caching() {
        let freshness = policy(Config {
            ttl: 0,
            ..Default::default()
        })
        .freshness(None, &HashMap::new(), now());
        assert_eq!(freshness.cache_control, "no-cache");
    }

    #[test]
    fn test_vary_axes() {
        assert_eq!(policy(Config::default()).vary(), None);
        assert_eq!(
            policy(Config {
                auto_avif: true,
                ..Default::default()
            })
            .vary(),
            Some("Accept")
        );
        assert_eq!(
            policy(Config {
                enforce_webp: true,
                enable_client_hints: true,
                ..Default::default()
            })
            .vary(),
            Some("Accept, Sec-CH-DPR, DPR, Sec-CH-Width, Width")
        );
    }

    #[test]
    fn test_last_modified_passthrough() {
        let mut origin = HashMap::new();
        origin.insert(
            LAST_MODIFIED_HEADER.to_string(),
            "Wed, 21 Oct 2015 07:28:00 GMT".to_string(),
        );

        assert_eq!(policy(Config::default()).last_modified(&origin), None);
        let enabled = policy(Config {
            last_modified_enabled: true,
            ..Default::default()
        });
        assert_eq!(
            enabled.last_modified(&origin),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }
}
