//! Common types for the image gateway
//!
//! - [`ImageBuffer`]: the unit of data flowing through the pipeline
//! - [`ImageFormat`]: container format tag
//! - [`ProcessingOptions`] / [`DownloadOptions`]: parsed request and per-fetch options
//! - [`GatewayError`]: error value carried to the HTTP boundary
//! - [`RequestContext`]: cancellation and deadline for one request

mod buffer;
mod context;
mod error;
mod format;
mod options;

pub use buffer::*;
pub use context::RequestContext;
pub use error::{ErrorKind, GatewayError, Result, STATUS_CLIENT_CLOSED_REQUEST};
pub use format::ImageFormat;
pub use options::{DownloadOptions, ProcessingOptions, SecurityOptions};
