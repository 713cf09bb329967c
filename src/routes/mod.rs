//! Route modules for the asset upload server

pub mod health;
pub mod upload;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_chunk_size = state.config().upload.max_chunk_size;

    Router::new()
        .nest("/health", health::router())
        .nest("/api/v1/health", health::router())
        .nest(
            "/api/v1/editor/chunked-upload",
            upload::router(max_chunk_size),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
