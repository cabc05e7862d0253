use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::core::codec::CodecError;
use crate::core::outbound::{DispatchError, SlotStoreError};

/// Errors surfaced by the HTTP layer and server startup.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    SlotStore(#[from] SlotStoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Audio error: {0}")]
    Audio(#[from] CodecError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SlotStore(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::SlotStore(_) => StatusCode::BAD_REQUEST,
            AppError::Dispatch(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Audio(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the client should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::SlotStore(e) => e.is_retryable(),
            AppError::Dispatch(_) => true,
            _ => false,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        let body = Json(json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_is_retryable_503() {
        let err = AppError::from(SlotStoreError::Unavailable("connection refused".into()));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_slot_request_is_400() {
        let err = AppError::from(SlotStoreError::InvalidRequest("missing job".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_into_response_status() {
        let response = AppError::BadRequest("nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
