//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `media_stream` - Telephony media stream WebSocket
//! - `outbound` - Outbound slot acquire/release/heartbeat for dialer workers

pub mod api;
pub mod media_stream;
pub mod outbound;

pub use media_stream::media_stream_handler;
