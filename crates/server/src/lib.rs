//! HTTP image gateway
//!
//! Serves images from an object store, keeping a derived cache of
//! cache-format copies that is populated lazily on first request:
//! - Image endpoint: any `GET` path not claimed below, e.g. `/300x200/photos/a.jpg@webp`
//! - `PUT /admin/master/refresh?path=<ref>`: rebuild one derived-cache entry
//! - `POST /master/refresh`: the same, JSON body, boolean answer
//! - `GET /health`

pub mod admission;
pub mod conditional;
pub mod config;
pub mod fallback;
pub mod gateway;
mod handlers;
pub mod logging;
pub mod parser;
pub mod pipeline;
pub mod refresh;
pub mod reporter;
pub mod resolver;
pub mod security;
mod types;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

pub use config::{load_config, Config};
pub use gateway::Gateway;
pub use handlers::*;
pub use types::*;

/// API server state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub gateway: Arc<Gateway>,
}

impl ApiState {
    #[must_use]
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway: Arc::new(gateway),
        }
    }
}

/// Build the API router with all endpoints
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/admin/master/refresh", put(admin_refresh))
        .route("/master/refresh", post(master_refresh))
        // Everything else is an image path
        .fallback(serve_image)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until the process exits
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: ApiState) -> Result<(), std::io::Error> {
    tracing::info!("Starting image gateway on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await
}
