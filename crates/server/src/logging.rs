//! Log setup and the per-request response log line

use axum::http::Method;
use imgate_common::{GatewayError, ProcessingOptions};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
    /// Compact single-line key/value output
    Structured,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "structured" => Ok(Self::Structured),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(format: LogFormat, level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "imgate_server={level},imgate_storage={level},imgate_transform={level},tower_http={level}"
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(fmt::layer()).try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Structured => registry.with(fmt::layer().compact()).try_init()?,
    }
    Ok(())
}

/// Identity of one inbound request, carried into the response log
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub id: String,
    pub method: Method,
    pub path: String,
}

impl RequestInfo {
    pub fn new(id: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method,
            path: path.into(),
        }
    }
}

/// Emit the single log line for a finished request: 5xx at error, 4xx at warn
pub fn log_response(
    req: &RequestInfo,
    status: u16,
    err: Option<&GatewayError>,
    image_url: Option<&str>,
    po: Option<&ProcessingOptions>,
) {
    let error = err.map(GatewayError::message);

    if status >= 500 {
        error!(
            request_id = %req.id,
            method = %req.method,
            path = %req.path,
            status,
            image_url,
            processing_options = ?po,
            error,
            "Completed with {}", status
        );
    } else if status >= 400 {
        warn!(
            request_id = %req.id,
            method = %req.method,
            path = %req.path,
            status,
            image_url,
            processing_options = ?po,
            error,
            "Completed with {}", status
        );
    } else {
        info!(
            request_id = %req.id,
            method = %req.method,
            path = %req.path,
            status,
            image_url,
            processing_options = ?po,
            "Completed with {}", status
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" structured ".parse::<LogFormat>().unwrap(), LogFormat::Structured);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("gcp".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_format_deserializes_lowercase() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
    }

    #[test]
    fn test_log_response_accepts_all_levels() {
        let req = RequestInfo::new("req-1", Method::GET, "/0x0/a.jpg");
        let err = GatewayError::cancelled();
        log_response(&req, 200, None, Some("a.jpg"), None);
        log_response(&req, 499, Some(&err), Some("a.jpg"), None);
        log_response(&req, 500, Some(&GatewayError::internal("x")), None, None);
    }
}
