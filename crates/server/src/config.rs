//! Configuration loading for the gateway.
//!
//! Settings come from an optional TOML file; a handful of deployment knobs can
//! be overridden from the environment (`IMGATE_*`). Every key has a default so
//! an empty file, or no file at all, yields a runnable configuration.

use anyhow::{Context, Result};
use imgate_common::{ImageFormat, SecurityOptions};
use imgate_storage::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::logging::LogFormat;

/// Default freshness lifetime (one year)
pub const DEFAULT_TTL: i64 = 31_536_000;

/// Deadline for a single administrative refresh
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

fn invalid(key: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.into(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reference prefixes that may be served; empty allows everything not denied
    pub allowed_sources: Vec<String>,
    /// Reference prefixes that are always rejected
    pub denied_sources: Vec<String>,
    pub max_src_file_size: Option<usize>,
    pub max_src_resolution: Option<f64>,
}

impl SecurityConfig {
    pub fn options(&self) -> SecurityOptions {
        SecurityOptions {
            max_src_file_size: self.max_src_file_size,
            max_src_resolution: self.max_src_resolution,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Authoritative store with untransformed sources
    pub primary: StoreConfig,
    /// Derived cache with cache-format copies
    pub derived: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,

    /// Concurrent transformations
    pub workers: usize,
    /// Requests allowed to wait for a worker; 0 disables the queue gate
    pub requests_queue_size: usize,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,

    /// Default freshness lifetime in seconds
    pub ttl: i64,
    pub cache_control_passthrough: bool,
    pub last_modified_enabled: bool,
    pub etag_enabled: bool,

    pub fallback_image_ttl: i64,
    /// Status sent with the fallback image; 0 uses the failure's status
    pub fallback_image_http_code: u16,
    /// Base64-encoded fallback image
    pub fallback_image_data: Option<String>,
    pub fallback_image_path: Option<PathBuf>,
    pub fallback_image_url: Option<String>,

    pub auto_webp: bool,
    pub enforce_webp: bool,
    pub auto_avif: bool,
    pub enforce_avif: bool,
    pub enable_client_hints: bool,

    pub always_rasterize_svg: bool,
    pub sanitize_svg: bool,
    pub svg_fix_unsupported: bool,
    pub skip_processing_formats: Vec<ImageFormat>,

    pub cookie_passthrough: bool,
    pub report_downloading_errors: bool,
    pub enable_debug_headers: bool,

    /// Format the derived cache is populated with
    pub cache_format: ImageFormat,
    /// Encoder quality when a request doesn't set one
    pub quality: u8,

    pub log_format: LogFormat,
    pub log_level: String,

    pub security: SecurityConfig,
    pub storage: StorageConfig,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(1)
        .max(1)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            workers: default_workers(),
            requests_queue_size: 0,
            request_timeout_secs: 10,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            ttl: DEFAULT_TTL,
            cache_control_passthrough: false,
            last_modified_enabled: false,
            etag_enabled: false,
            fallback_image_ttl: 0,
            fallback_image_http_code: 200,
            fallback_image_data: None,
            fallback_image_path: None,
            fallback_image_url: None,
            auto_webp: false,
            enforce_webp: false,
            auto_avif: false,
            enforce_avif: false,
            enable_client_hints: false,
            always_rasterize_svg: false,
            sanitize_svg: true,
            svg_fix_unsupported: false,
            skip_processing_formats: Vec::new(),
            cookie_passthrough: false,
            report_downloading_errors: true,
            enable_debug_headers: false,
            cache_format: ImageFormat::Webp,
            quality: 80,
            log_format: LogFormat::Pretty,
            log_level: "info".to_string(),
            security: SecurityConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Trimmed value of `key`, or `None` when unset or blank
fn lookup_trimmed<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(key, format!("can't parse {value:?}")))
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    /// Apply `IMGATE_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup_trimmed(&lookup, "IMGATE_BIND") {
            self.bind = bind;
        }
        if let Some(workers) = lookup_trimmed(&lookup, "IMGATE_WORKERS") {
            self.workers = parse_env("IMGATE_WORKERS", &workers)?;
        }
        if let Some(size) = lookup_trimmed(&lookup, "IMGATE_REQUESTS_QUEUE_SIZE") {
            self.requests_queue_size = parse_env("IMGATE_REQUESTS_QUEUE_SIZE", &size)?;
        }
        if let Some(ttl) = lookup_trimmed(&lookup, "IMGATE_TTL") {
            self.ttl = parse_env("IMGATE_TTL", &ttl)?;
        }
        if let Some(format) = lookup_trimmed(&lookup, "IMGATE_LOG_FORMAT") {
            self.log_format = parse_env("IMGATE_LOG_FORMAT", &format)?;
        }
        if let Some(level) = lookup_trimmed(&lookup, "IMGATE_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs", "must be positive"));
        }
        if self.refresh_timeout_secs == 0 {
            return Err(invalid("refresh_timeout_secs", "must be positive"));
        }
        if self.ttl < 0 {
            return Err(invalid("ttl", "must not be negative"));
        }
        if self.fallback_image_ttl < 0 {
            return Err(invalid("fallback_image_ttl", "must not be negative"));
        }
        if self.fallback_image_http_code != 0
            && !(100..=599).contains(&self.fallback_image_http_code)
        {
            return Err(invalid(
                "fallback_image_http_code",
                format!("{} is not an HTTP status", self.fallback_image_http_code),
            ));
        }

        let fallback_sources = [
            self.fallback_image_data.is_some(),
            self.fallback_image_path.is_some(),
            self.fallback_image_url.is_some(),
        ];
        if fallback_sources.iter().filter(|set| **set).count() > 1 {
            return Err(invalid(
                "fallback_image",
                "only one of fallback_image_data, fallback_image_path and fallback_image_url may be set",
            ));
        }

        if matches!(self.cache_format, ImageFormat::Unknown | ImageFormat::Svg) {
            return Err(invalid(
                "cache_format",
                format!("{} can't be used for the derived cache", self.cache_format),
            ));
        }
        if self.security.max_src_resolution.is_some_and(|mp| mp <= 0.0) {
            return Err(invalid("security.max_src_resolution", "must be positive"));
        }
        Ok(())
    }
}

/// Default config file location: `$IMGATE_CONFIG`, else `imgate.toml` in the working directory
pub fn default_config_path() -> PathBuf {
    std::env::var("IMGATE_CONFIG")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from("imgate.toml"), PathBuf::from)
}

/// Load configuration from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config =
        toml::from_str(&contents).context("Failed to parse config file as TOML")?;
    Ok(config)
}
