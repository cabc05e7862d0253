pub mod config;
pub mod core;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

// Re-export commonly used items for convenience
pub use config::ServerConfig;
pub use core::*;
pub use errors::app_error::{AppError, AppResult};
pub use state::AppState;

use axum::Router;
use std::sync::Arc;

/// Assemble the full application router.
///
/// The media stream route sits behind the connection limit; the REST routes
/// do not.
pub fn build_router(state: Arc<AppState>) -> Router {
    let media_routes = routes::media::create_media_router().layer(
        axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::connection_limit_middleware,
        ),
    );

    routes::api::create_api_router()
        .merge(media_routes)
        .with_state(state)
}
