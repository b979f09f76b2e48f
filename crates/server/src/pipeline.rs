//! Image request pipeline
//!
//! Parsing → security check → [raw passthrough] → format validation →
//! conditional prep → queue admission → worker admission → origin resolution →
//! {not modified | skip transform | transform} → response.
//!
//! Every exit path releases what it holds: permits are guards and image
//! buffers release on drop. Any failure after admission is checked against
//! the request context first, so a dead request is reported as a timeout or
//! cancellation rather than as whatever broke underneath it.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use imgate_common::{
    DownloadOptions, GatewayError, ImageBuffer, ImageFormat, ProcessingOptions, RequestContext,
    ETAG_HEADER, ORIGIN_HEIGHT_HEADER, ORIGIN_WIDTH_HEADER, RESULT_HEIGHT_HEADER,
    RESULT_WIDTH_HEADER,
};
use std::collections::HashMap;
use tracing::warn;

use crate::conditional::EtagHandler;
use crate::gateway::Gateway;
use crate::logging::{log_response, RequestInfo};
use crate::reporter::record_error;
use crate::resolver::{Fetched, Resolution};

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// One image request, detached from the HTTP framework
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub info: RequestInfo,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl ImageRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    }
}

/// What is known about the request for the final log line
#[derive(Debug, Default)]
struct Trace {
    image_url: Option<String>,
    po: Option<ProcessingOptions>,
}

type Headers = Vec<(String, String)>;

fn push(headers: &mut Headers, name: &str, value: impl Into<String>) {
    headers.push((name.to_string(), value.into()));
}

fn build_response(status: u16, headers: Headers, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let map = response.headers_mut();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!("Dropping invalid response header {}: {:?}", name, value),
        }
    }
    response
}

impl Gateway {
    /// Serve one image request. Never fails: errors become responses.
    pub async fn handle_image(&self, ctx: &RequestContext, req: &ImageRequest) -> Response {
        let mut trace = Trace::default();

        match self.process(ctx, req, &mut trace).await {
            Ok(response) => {
                log_response(
                    &req.info,
                    response.status().as_u16(),
                    None,
                    trace.image_url.as_deref(),
                    trace.po.as_ref(),
                );
                response
            }
            Err(err) => self.error_response(ctx, req, err, &trace),
        }
    }

    async fn process(
        &self,
        ctx: &RequestContext,
        req: &ImageRequest,
        trace: &mut Trace,
    ) -> Result<Response, GatewayError> {
        let (po, reference) = self.parser.parse(&req.uri, req.header("accept"))?;
        trace.image_url = Some(reference.clone());
        trace.po = Some(po.clone());

        self.security.verify_source(&reference)?;

        let mut dl = DownloadOptions::new();
        if self.config.cookie_passthrough {
            dl.cookies = req.header("cookie").map(ToString::to_string);
        }

        if po.raw {
            return self.stream_raw(ctx, req, &reference, &po, dl).await;
        }

        if po.format != ImageFormat::Unknown
            && po.format != ImageFormat::Svg
            && !self.transformer.supports_save(po.format)
        {
            return Err(GatewayError::unsupported_format(format!(
                "Resulting image format is not supported: {}",
                po.format
            )));
        }

        let mut etag = EtagHandler::default();
        if self.config.etag_enabled {
            if let Some(if_none_match) = req.header("if-none-match") {
                etag.parse_expected(if_none_match);
            }
            if etag.set_actual_processing_options(&po) {
                if let Some(expected) = etag.image_etag_expected() {
                    dl.set_header("If-None-Match", expected);
                }
            }
        }
        if self.config.last_modified_enabled {
            if let Some(since) = req.header("if-modified-since") {
                dl.set_header("If-Modified-Since", since);
            }
        }

        let _queue = self.gate.try_acquire_queue()?;
        let _worker = self.gate.acquire_worker(ctx).await?;

        let (mut image, status) = match self.resolver.resolve(ctx, &reference, &dl, &po).await? {
            Resolution::Found(image) => (image, 200),
            Resolution::NotModified(headers) => {
                let echoed = if self.config.etag_enabled && etag.image_etag_expected().is_some() {
                    etag.generate_expected()
                } else {
                    None
                };
                return Ok(self.not_modified(req, &po, echoed, &headers));
            }
            Resolution::Fallback {
                image,
                status,
                cause,
            } => {
                record_error(&*self.reporter, "download", &cause);
                if cause.should_report() {
                    self.reporter.report(&cause, &req.info);
                }
                warn!(
                    request_id = %req.info.id,
                    image_url = %reference,
                    "Could not load image. Using fallback image: {}",
                    cause
                );
                (image, status)
            }
        };

        ctx.check()?;

        let mut actual_etag = None;
        if self.config.etag_enabled && status == 200 {
            etag.set_actual_image_data(&image);
            actual_etag = etag.generate_actual();
            if etag.matches() {
                return Ok(self.not_modified(req, &po, actual_etag, &image.headers));
            }
        }

        ctx.check()?;

        let skip = (image.format == po.format || po.format == ImageFormat::Unknown)
            && (po.skip_processing_formats.contains(&image.format)
                || (image.format == ImageFormat::Svg && !self.config.always_rasterize_svg));

        if skip {
            if image.format == ImageFormat::Svg && self.config.sanitize_svg {
                let sanitized = self.transformer.sanitize(&image).await?;
                image.replace(sanitized);
            }
            let origin_headers = image.headers.clone();
            let origin_len = image.len();
            return Ok(self.respond_with_image(
                req,
                status,
                &image,
                &po,
                &origin_headers,
                origin_len,
                actual_etag,
            ));
        }

        if !self.transformer.supports_load(image.format) {
            return Err(GatewayError::unsupported_format(format!(
                "Source image format is not supported: {}",
                image.format
            )));
        }

        // Vector output can't be produced from a transform
        if po.format == ImageFormat::Svg {
            return Err(GatewayError::unsupported_format(
                "Resulting image format is not supported: svg",
            ));
        }

        if image.format == ImageFormat::Svg && self.config.svg_fix_unsupported {
            if let Some(fixed) = self.transformer.fix_unsupported(&image).await? {
                image.replace(fixed);
            }
        }

        let origin_headers = image.headers.clone();
        let origin_len = image.len();

        let result = self.transformer.transform(ctx, image, &po).await?;

        ctx.check()?;

        Ok(self.respond_with_image(
            req,
            status,
            &result,
            &po,
            &origin_headers,
            origin_len,
            actual_etag,
        ))
    }

    /// `raw=1`: primary object as stored, no admission and no transform
    async fn stream_raw(
        &self,
        ctx: &RequestContext,
        req: &ImageRequest,
        reference: &str,
        po: &ProcessingOptions,
        mut dl: DownloadOptions,
    ) -> Result<Response, GatewayError> {
        if self.config.etag_enabled {
            if let Some(if_none_match) = req.header("if-none-match") {
                dl.set_header("If-None-Match", if_none_match);
            }
        }
        if self.config.last_modified_enabled {
            if let Some(since) = req.header("if-modified-since") {
                dl.set_header("If-Modified-Since", since);
            }
        }

        let image = match self
            .resolver
            .fetch_primary(ctx, reference, &dl, &po.security)
            .await?
        {
            Fetched::Image(image) => image,
            Fetched::NotModified(headers) => {
                let echoed = headers.get(ETAG_HEADER).cloned();
                return Ok(self.not_modified(req, po, echoed, &headers));
            }
        };

        let mut headers = self.freshness_headers(req, po, &image.headers);
        let content_type = match image.format {
            ImageFormat::Unknown => "application/octet-stream",
            format => format.mime(),
        };
        push(&mut headers, "Content-Type", content_type);
        if let Some(last_modified) = self.cache.last_modified(&image.headers) {
            push(&mut headers, "Last-Modified", last_modified);
        }
        if self.config.etag_enabled {
            if let Some(origin_etag) = image.header(ETAG_HEADER) {
                push(&mut headers, "ETag", origin_etag);
            }
        }

        Ok(build_response(200, headers, image.data.clone()))
    }

    /// Request id, `Cache-Control`, `Expires` and `Vary`
    fn freshness_headers(
        &self,
        req: &ImageRequest,
        po: &ProcessingOptions,
        origin: &HashMap<String, String>,
    ) -> Headers {
        let mut headers = Headers::new();
        push(&mut headers, REQUEST_ID_HEADER, req.info.id.as_str());

        let freshness = self.cache.freshness(po.expires, origin, Utc::now());
        push(&mut headers, "Cache-Control", freshness.cache_control);
        if let Some(expires) = freshness.expires {
            push(&mut headers, "Expires", expires);
        }
        if let Some(vary) = self.cache.vary() {
            push(&mut headers, "Vary", vary);
        }
        headers
    }

    fn not_modified(
        &self,
        req: &ImageRequest,
        po: &ProcessingOptions,
        etag: Option<String>,
        origin: &HashMap<String, String>,
    ) -> Response {
        let mut headers = self.freshness_headers(req, po, origin);
        if let Some(etag) = etag {
            push(&mut headers, "ETag", etag);
        }
        build_response(304, headers, Bytes::new())
    }

    #[allow(clippy::too_many_arguments)]
    fn respond_with_image(
        &self,
        req: &ImageRequest,
        status: u16,
        result: &ImageBuffer,
        po: &ProcessingOptions,
        origin: &HashMap<String, String>,
        origin_len: usize,
        etag: Option<String>,
    ) -> Response {
        let mut headers = self.freshness_headers(req, po, origin);
        push(&mut headers, "Content-Type", result.format.mime());

        if let Some(last_modified) = self.cache.last_modified(origin) {
            push(&mut headers, "Last-Modified", last_modified);
        }
        if let Some(etag) = etag {
            push(&mut headers, "ETag", etag);
        }

        if self.config.enable_debug_headers {
            push(&mut headers, "X-Origin-Content-Length", origin_len.to_string());
            for name in [
                ORIGIN_WIDTH_HEADER,
                ORIGIN_HEIGHT_HEADER,
                RESULT_WIDTH_HEADER,
                RESULT_HEIGHT_HEADER,
            ] {
                if let Some(value) = result.header(name) {
                    push(&mut headers, name, value);
                }
            }
        }

        build_response(status, headers, result.data.clone())
    }

    fn error_response(
        &self,
        ctx: &RequestContext,
        req: &ImageRequest,
        err: GatewayError,
        trace: &Trace,
    ) -> Response {
        let err = match ctx.check() {
            Err(ctx_err) => ctx_err,
            Ok(()) => err,
        };

        record_error(&*self.reporter, err.kind().as_str(), &err);
        if err.should_report() {
            self.reporter.report(&err, &req.info);
        }

        let status = err.status_or_default();
        log_response(
            &req.info,
            status,
            Some(&err),
            trace.image_url.as_deref(),
            trace.po.as_ref(),
        );

        let mut headers = Headers::new();
        push(&mut headers, REQUEST_ID_HEADER, req.info.id.as_str());
        push(&mut headers, "Content-Type", "text/plain; charset=utf-8");
        build_response(status, headers, Bytes::from(err.message().to_string()))
    }
}
