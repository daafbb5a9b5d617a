//! HTTP surface of the blocksync core
//!
//! The one boundary where the core is exposed as a service: the block upload
//! protocol (begin / upload file / commit), plus health endpoints. Tenancy is
//! carried by the `X-Scope-OrgID` request header.

mod telemetry;
pub mod upload;

use crate::upload::BlockUploadService;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub uploads: Arc<BlockUploadService>,
}

/// Build the HTTP API router
pub fn build_http_router(uploads: Arc<BlockUploadService>) -> Router {
    use axum::middleware;
    use tower_http::cors::{Any, CorsLayer};

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        // Block upload protocol: begin / commit on the block route, file
        // streaming on the files route.
        .route("/api/v1/upload/block/:block", post(upload::handle_block_upload))
        .route(
            "/api/v1/upload/block/:block/files",
            post(upload::handle_block_file_upload),
        )
        .with_state(ApiState { uploads })
        .layer(middleware::from_fn(telemetry::http_observability_middleware))
        .layer(cors)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Readiness check endpoint
async fn ready_check() -> &'static str {
    "READY"
}
