//! Telephony media stream route

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::media_stream_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the media stream router
///
/// # Endpoint
///
/// `GET /media-stream` - WebSocket upgrade for one call's media stream
///
/// # Protocol
///
/// The carrier sends `connected`, then `start` (call sid, stream sid and
/// custom parameters such as `businessId` and `jobId`), then 20ms μ-law
/// `media` frames until `stop`. The server answers with `media` frames,
/// `clear` on barge-in, and closes the socket to end the call.
pub fn create_media_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/media-stream", get(media_stream_handler))
        .layer(TraceLayer::new_for_http())
}
