use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{api, outbound};
use crate::state::AppState;
use std::sync::Arc;

/// Create the REST router: health check and the outbound slot API.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api::health_check))
        .route("/outbound/acquire", post(outbound::acquire_slot))
        .route("/outbound/release", post(outbound::release_slot))
        .route("/outbound/heartbeat", post(outbound::heartbeat_slot))
        .route("/outbound/slots/{business_id}", get(outbound::slot_snapshot))
        .layer(TraceLayer::new_for_http())
}
