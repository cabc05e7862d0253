//! Outbound slot API
//!
//! Dialer workers ask for a slot before placing a call and hand it back when
//! the call is over. A `queued` answer means the job will be dispatched once
//! a slot frees up; the worker does not poll.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::core::outbound::{AcquireOutcome, ReleaseOutcome, SlotSnapshot};
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRequest {
    pub business_id: String,
    pub job_id: String,
}

impl SlotRequest {
    fn validate(&self) -> AppResult<()> {
        if self.business_id.trim().is_empty() {
            return Err(AppError::BadRequest("businessId is required".to_string()));
        }
        if self.job_id.trim().is_empty() {
            return Err(AppError::BadRequest("jobId is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// `false` once the lease has been lost; the worker should stop.
    pub alive: bool,
}

pub async fn acquire_slot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SlotRequest>,
) -> AppResult<Json<AcquireOutcome>> {
    request.validate()?;
    let outcome = state
        .semaphore
        .acquire(&request.business_id, &request.job_id)
        .await?;
    info!(business_id = %request.business_id, job_id = %request.job_id, ?outcome, "slot requested");
    Ok(Json(outcome))
}

pub async fn release_slot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SlotRequest>,
) -> AppResult<Json<ReleaseOutcome>> {
    request.validate()?;
    let outcome = state
        .semaphore
        .release(&request.business_id, &request.job_id)
        .await?;
    // The release has already happened; a failed dispatch must not hide it.
    if let Some(next) = outcome.promoted.clone()
        && let Err(e) = state.dispatcher.dispatch(next).await
    {
        error!(business_id = %request.business_id, "failed to dispatch promoted job: {}", e);
    }
    Ok(Json(outcome))
}

pub async fn heartbeat_slot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SlotRequest>,
) -> AppResult<Json<HeartbeatResponse>> {
    request.validate()?;
    let alive = state
        .semaphore
        .heartbeat(&request.business_id, &request.job_id)
        .await?;
    Ok(Json(HeartbeatResponse { alive }))
}

pub async fn slot_snapshot(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
) -> AppResult<Json<SlotSnapshot>> {
    Ok(Json(state.semaphore.snapshot(&business_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_request_wire_names() {
        let request: SlotRequest =
            serde_json::from_str(r#"{"businessId":"dental","jobId":"job-1"}"#).unwrap();
        assert_eq!(request.business_id, "dental");
        assert_eq!(request.job_id, "job-1");
    }

    #[test]
    fn test_blank_ids_rejected() {
        let request = SlotRequest {
            business_id: " ".to_string(),
            job_id: "job-1".to_string(),
        };
        assert!(matches!(request.validate(), Err(AppError::BadRequest(_))));
    }
}
