//! Error-rate recording and exception reporting

use imgate_common::{GatewayError, STATUS_CLIENT_CLOSED_REQUEST};
use tracing::{error, warn};

use crate::logging::RequestInfo;

/// Sink for failures observed while serving requests
pub trait ErrorReporter: Send + Sync {
    /// Count an error under `category` (error-rate signal)
    fn record(&self, category: &str, err: &GatewayError);

    /// Forward an error flagged `should_report` to exception tracking
    fn report(&self, err: &GatewayError, req: &RequestInfo);
}

/// Record `err` unless it is a client cancellation. Deadline expiries are
/// always counted as `timeout`.
pub fn record_error(reporter: &dyn ErrorReporter, category: &str, err: &GatewayError) {
    match err.status() {
        Some(STATUS_CLIENT_CLOSED_REQUEST) => {}
        Some(503) => reporter.record("timeout", err),
        _ if err.is_cancelled() => {}
        _ => reporter.record(category, err),
    }
}

/// Reporter that writes both signals to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn record(&self, category: &str, err: &GatewayError) {
        warn!(category, status = err.status_or_default(), "{}", err);
    }

    fn report(&self, err: &GatewayError, req: &RequestInfo) {
        error!(
            request_id = %req.id,
            path = %req.path,
            kind = err.kind().as_str(),
            status = err.status_or_default(),
            "Reported error: {}",
            err
        );
    }
}
