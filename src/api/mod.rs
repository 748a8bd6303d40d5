//! HTTP surface over [`SwapService`].

pub mod error;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use routes::{ApiState, job_routes};

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::service::SwapService;

/// Room for multipart framing on top of the two images.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Full application router: job routes under the configured prefix, with
/// request tracing, permissive CORS and a body limit sized for two uploads.
pub fn router(service: Arc<SwapService>) -> Router {
    let prefix = service.config().route_prefix.clone();
    let body_limit = service
        .config()
        .max_upload_bytes
        .saturating_mul(2)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let routes = job_routes(ApiState { service });
    let app = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(&prefix, routes)
    };

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .layer(DefaultBodyLimit::max(body_limit)),
    )
}
