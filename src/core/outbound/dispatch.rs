use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use super::OutboundSlot;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatch request failed: {0}")]
    RequestFailed(String),

    #[error("Dispatcher rejected job {job_id}: HTTP {status}")]
    Rejected { job_id: String, status: u16 },
}

/// Starts the outbound call for a job that just received a slot.
#[async_trait]
pub trait OutboundDispatcher: Send + Sync {
    async fn dispatch(&self, slot: OutboundSlot) -> Result<(), DispatchError>;
}

/// Records promotions without starting anything. Used when no dialer is
/// configured.
pub struct LogDispatcher;

#[async_trait]
impl OutboundDispatcher for LogDispatcher {
    async fn dispatch(&self, slot: OutboundSlot) -> Result<(), DispatchError> {
        tracing::info!(
            business_id = %slot.business_id,
            job_id = %slot.job_id,
            "outbound job ready to dial"
        );
        Ok(())
    }
}

/// POSTs the promoted slot to the dialer service.
pub struct WebhookDispatcher {
    client: Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl OutboundDispatcher for WebhookDispatcher {
    async fn dispatch(&self, slot: OutboundSlot) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.url)
            .json(&slot)
            .send()
            .await
            .map_err(|e| DispatchError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Rejected {
                job_id: slot.job_id,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn slot() -> OutboundSlot {
        OutboundSlot {
            business_id: "biz".to_string(),
            job_id: "job-7".to_string(),
            acquired_at: 1,
        }
    }

    #[tokio::test]
    async fn test_webhook_posts_slot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dial"))
            .and(body_partial_json(serde_json::json!({"job_id": "job-7"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher =
            WebhookDispatcher::new(format!("{}/dial", server.uri()), Duration::from_secs(2)).unwrap();
        dispatcher.dispatch(slot()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_rejection_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher = WebhookDispatcher::new(server.uri(), Duration::from_secs(2)).unwrap();
        let err = dispatcher.dispatch(slot()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { status: 500, .. }));
    }
}
