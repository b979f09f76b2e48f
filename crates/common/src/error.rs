//! Gateway error value
//!
//! Every failure that reaches the HTTP boundary is a [`GatewayError`]: a
//! category, a message, an optional HTTP status and a report flag. Wrapping
//! keeps the innermost status and accumulates the report flag.

use thiserror::Error;

/// Non-standard status used for requests cancelled by the client
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Error category, used for error-rate recording and response mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed reference or options
    Parsing,
    /// Reference rejected by the source policy
    Security,
    /// Queue gate saturated
    Admission,
    /// Origin or derived-cache fetch failed
    Download,
    /// Transform, sanitize or fix-up step failed
    Transform,
    /// Derived-cache write failed
    Upload,
    /// Request deadline expired
    Timeout,
    /// Client went away or the request was cancelled
    Cancelled,
    /// Broken invariant
    Internal,
}

impl ErrorKind {
    /// Category label used when recording error rates
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsing => "path_parsing",
            Self::Security => "security",
            Self::Admission => "queue",
            Self::Download => "download",
            Self::Transform => "processing",
            Self::Upload => "upload",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// Error carried through the request pipeline
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GatewayError {
    kind: ErrorKind,
    message: String,
    status: Option<u16>,
    should_report: bool,
}

impl GatewayError {
    /// Create an error with no status attached
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            should_report: false,
        }
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parsing, message).with_status(404)
    }

    /// Requested or source format the gateway can't handle
    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parsing, message).with_status(422)
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, message).with_status(403)
    }

    pub fn too_many_requests() -> Self {
        Self::new(ErrorKind::Admission, "Too many requests").with_status(429)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "Request timed out").with_status(503)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Request was cancelled")
            .with_status(STATUS_CLIENT_CLOSED_REQUEST)
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Download, message)
    }

    pub fn transform(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transform, message)
    }

    pub fn upload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upload, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach a status unless one is already present
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        if self.status.is_none() && status != 0 {
            self.status = Some(status);
        }
        self
    }

    /// Flag the error for the external error reporter
    #[must_use]
    pub fn reportable(mut self) -> Self {
        self.should_report = true;
        self
    }

    /// Prefix the message, keeping the innermost status and OR-ing the report flag
    #[must_use]
    pub fn wrap(mut self, prefix: &str, status: Option<u16>, should_report: bool) -> Self {
        if !prefix.is_empty() {
            self.message = format!("{prefix}: {}", self.message);
        }
        if let Some(status) = status {
            self = self.with_status(status);
        }
        self.should_report |= should_report;
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Status carried by the error, if any
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Status to send to the client; unclassified errors become 500
    #[must_use]
    pub fn status_or_default(&self) -> u16 {
        self.status.unwrap_or(500)
    }

    #[must_use]
    pub fn should_report(&self) -> bool {
        self.should_report
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_keeps_innermost_status() {
        let err = GatewayError::download("object missing").with_status(404);
        let wrapped = err.wrap("Can't download source image", Some(500), false);

        assert_eq!(wrapped.status(), Some(404));
        assert_eq!(wrapped.message(), "Can't download source image: object missing");
        assert_eq!(wrapped.kind(), ErrorKind::Download);
    }

    #[test]
    fn test_wrap_fills_missing_status() {
        let wrapped = GatewayError::transform("bad pixels").wrap("", Some(422), false);
        assert_eq!(wrapped.status(), Some(422));
        assert_eq!(wrapped.message(), "bad pixels");
    }

    #[test]
    fn test_wrap_accumulates_report_flag() {
        let err = GatewayError::download("boom").reportable();
        let wrapped = err.wrap("outer", None, false);
        assert!(wrapped.should_report());

        let err = GatewayError::download("boom").wrap("outer", None, true);
        assert!(err.should_report());
    }

    #[test]
    fn test_default_status() {
        assert_eq!(GatewayError::internal("x").status_or_default(), 500);
        assert_eq!(GatewayError::too_many_requests().status_or_default(), 429);
        assert_eq!(GatewayError::cancelled().status_or_default(), 499);
        assert_eq!(GatewayError::timeout().status_or_default(), 503);
    }

    #[test]
    fn test_zero_status_is_ignored() {
        let err = GatewayError::download("x").with_status(0);
        assert_eq!(err.status(), None);
    }
}
