//! HTTP service: routes, handlers and error responses.
//!
//! ## Structure
//!
//! - [`handler`] - Endpoint handlers and the shared [`AppState`].
//! - [`error`] - [`ApiError`](error::ApiError), the JSON error response.
//!
//! ## Routes
//!
//! | Method | Path            | Response                         |
//! |--------|-----------------|----------------------------------|
//! | GET    | `/`             | `{status, message}`              |
//! | GET    | `/health`       | `{status, version, timestamp, uptime, active_runs}` |
//! | POST   | `/query`        | `{result}`, or NDJSON if `stream` |
//! | POST   | `/query/stream` | NDJSON progress and result       |

pub mod error;
pub mod handler;

use crate::server::middleware::request_id_middleware;
use axum::{
    Router,
    routing::{get, post},
};
pub use handler::AppState;
use tower_http::cors::{Any, CorsLayer};

/// Builds the application router around `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handler::root))
        .route("/health", get(handler::health))
        .route("/query", post(handler::query))
        .route("/query/stream", post(handler::query_stream))
        .with_state(state)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
