//! Source reference policy and per-fetch limits

use imgate_common::{GatewayError, SecurityOptions};

use crate::config::SecurityConfig;

#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    allowed: Vec<String>,
    denied: Vec<String>,
}

fn strip(prefix: &str) -> &str {
    prefix.trim_start_matches('/')
}

impl SecurityPolicy {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            allowed: config.allowed_sources.clone(),
            denied: config.denied_sources.clone(),
        }
    }

    /// Reject references that escape the store or fall outside the allow/deny lists
    pub fn verify_source(&self, reference: &str) -> Result<(), GatewayError> {
        let reference = reference.trim_start_matches('/');

        if reference.is_empty() {
            return Err(GatewayError::security("Source image reference is empty"));
        }
        if reference.split('/').any(|segment| segment == "..") {
            return Err(GatewayError::security(format!(
                "Source image reference is not allowed: {reference}"
            )));
        }
        if self.denied.iter().any(|p| reference.starts_with(strip(p))) {
            return Err(GatewayError::security(format!(
                "Source image is denied: {reference}"
            )));
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|p| reference.starts_with(strip(p))) {
            return Err(GatewayError::security(format!(
                "Source image is not allowed: {reference}"
            )));
        }
        Ok(())
    }
}

/// Enforce `max_src_file_size` on fetched bytes
pub fn check_file_size(options: &SecurityOptions, len: usize) -> Result<(), GatewayError> {
    match options.max_src_file_size {
        Some(max) if len > max => Err(GatewayError::unsupported_format(format!(
            "Source image file is too big: {len} > {max} bytes"
        ))),
        _ => Ok(()),
    }
}
