//! HTTP request handlers

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use imgate_common::RequestContext;
use tracing::error;
use uuid::Uuid;

use crate::{
    logging::{log_response, RequestInfo},
    pipeline::{ImageRequest, REQUEST_ID_HEADER},
    types::{ErrorResponse, HealthResponse, RefreshQuery, RefreshRequest, RefreshResponse},
    ApiState,
};

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string)
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Image endpoint, mounted as the router fallback
///
/// The pipeline runs in its own task under the request deadline. If the
/// client goes away this handler is dropped, the drop guard cancels the
/// context, and the task finishes as a cancellation.
pub async fn serve_image(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").into_response();
    }

    let req = ImageRequest {
        info: RequestInfo::new(request_id(&headers), method, uri.path()),
        uri,
        headers,
    };

    let gateway = state.gateway.clone();
    let ctx = RequestContext::with_timeout(gateway.config().request_timeout());
    let _cancel_on_drop = ctx.drop_guard();

    let task = tokio::spawn(async move { gateway.handle_image(&ctx, &req).await });

    match task.await {
        Ok(response) => response,
        Err(e) => {
            error!("Image request task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

/// `PUT /admin/master/refresh?path=<ref>`
pub async fn admin_refresh(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<RefreshQuery>,
) -> Response {
    let info = RequestInfo::new(request_id(&headers), Method::PUT, "/admin/master/refresh");
    let path = query.path.unwrap_or_default();

    let ctx = RequestContext::new();
    let _cancel_on_drop = ctx.drop_guard();

    match state.gateway.refresh_derived_cache(&ctx, &path).await {
        Ok(result) => {
            log_response(&info, 200, None, Some(&path), None);
            (StatusCode::OK, Json(RefreshResponse::from(result))).into_response()
        }
        Err(err) => {
            let status = err.status();
            log_response(&info, status, err.cause(), Some(&path), None);
            (
                status_code(status),
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// `POST /master/refresh` with `{"path": "<ref>"}`; answers `true` or `false`
pub async fn master_refresh(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = RequestInfo::new(request_id(&headers), Method::POST, "/master/refresh");

    let path = match serde_json::from_slice::<RefreshRequest>(&body) {
        Ok(request) if !request.path.trim().is_empty() => request.path,
        _ => {
            log_response(&info, 400, None, None, None);
            return (StatusCode::BAD_REQUEST, Json(false)).into_response();
        }
    };

    let ctx = RequestContext::new();
    let _cancel_on_drop = ctx.drop_guard();

    match state.gateway.refresh_derived_cache(&ctx, &path).await {
        Ok(_) => {
            log_response(&info, 200, None, Some(&path), None);
            (StatusCode::OK, Json(true)).into_response()
        }
        Err(err) => {
            let status = err.status();
            log_response(&info, status, err.cause(), Some(&path), None);
            (status_code(status), Json(false)).into_response()
        }
    }
}
