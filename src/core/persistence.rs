//! Persistence Sink: append-only call outcome records written at teardown.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::session::TranscriptEntry;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink request failed: {0}")]
    RequestFailed(String),

    #[error("Sink rejected record: HTTP {0}")]
    Rejected(u16),

    #[error("Sink write timed out after {0:?}")]
    Timeout(Duration),
}

pub type SinkResult<T> = Result<T, SinkError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The assistant ended the conversation and the audio drained.
    Completed,
    /// Same, but the drain bound expired first.
    DrainTimeout,
    CallerHungUp,
    ProviderUnavailable,
    /// The telephony leg never identified the stream.
    StartTimeout,
    DirectoryFailed,
    Error(String),
}

impl EndReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Completed => "completed",
            Self::DrainTimeout => "drain_timeout",
            Self::CallerHungUp => "caller_hung_up",
            Self::ProviderUnavailable => "provider unavailable",
            Self::StartTimeout => "start_timeout",
            Self::DirectoryFailed => "directory_failed",
            Self::Error(message) => message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOutcome {
    pub call_id: String,
    pub business_id: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
    pub ai_responses: Vec<String>,
    pub end_reason: EndReason,
    pub duration_ms: u64,
    /// Caller frames discarded while a pipeline turn was running.
    pub dropped_frames: u64,
}

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn record(&self, outcome: &CallOutcome) -> SinkResult<()>;
}

/// Writes outcomes to the log only.
pub struct TracingSink;

#[async_trait]
impl PersistenceSink for TracingSink {
    async fn record(&self, outcome: &CallOutcome) -> SinkResult<()> {
        tracing::info!(
            call_id = %outcome.call_id,
            business_id = ?outcome.business_id,
            end_reason = outcome.end_reason.as_str(),
            duration_ms = outcome.duration_ms,
            turns = outcome.transcript.len(),
            dropped_frames = outcome.dropped_frames,
            "call outcome"
        );
        Ok(())
    }
}

/// POSTs each outcome as JSON.
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> SinkResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PersistenceSink for WebhookSink {
    async fn record(&self, outcome: &CallOutcome) -> SinkResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(outcome)
            .send()
            .await
            .map_err(|e| SinkError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Write `outcome` in the background, giving up after `timeout`.
///
/// The caller never waits on the sink.
pub fn record_detached(
    sink: Arc<dyn PersistenceSink>,
    outcome: CallOutcome,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = match tokio::time::timeout(timeout, sink.record(&outcome)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(timeout)),
        };
        if let Err(e) = result {
            tracing::error!(call_id = %outcome.call_id, "failed to persist call outcome: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Speaker;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn outcome() -> CallOutcome {
        CallOutcome {
            call_id: "CA1".to_string(),
            business_id: Some("dental".to_string()),
            transcript: vec![TranscriptEntry {
                speaker: Speaker::Caller,
                text: "hi".to_string(),
                offset_ms: 1200,
            }],
            ai_responses: vec!["Hello!".to_string()],
            end_reason: EndReason::ProviderUnavailable,
            duration_ms: 4200,
            dropped_frames: 0,
        }
    }

    #[test]
    fn test_outcome_wire_shape() {
        let json = serde_json::to_value(outcome()).unwrap();
        assert_eq!(json["callId"], "CA1");
        assert_eq!(json["endReason"], "provider_unavailable");
        assert_eq!(json["aiResponses"][0], "Hello!");
        assert_eq!(json["durationMs"], 4200);
    }

    #[tokio::test]
    async fn test_webhook_sink_posts_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/outcomes"))
            .and(body_partial_json(serde_json::json!({"callId": "CA1"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(format!("{}/outcomes", server.uri()), Duration::from_secs(2)).unwrap();
        sink.record(&outcome()).await.unwrap();
    }

    struct StuckSink;

    #[async_trait]
    impl PersistenceSink for StuckSink {
        async fn record(&self, _outcome: &CallOutcome) -> SinkResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_detached_is_bounded() {
        let handle = record_detached(Arc::new(StuckSink), outcome(), Duration::from_secs(3));
        tokio::time::timeout(Duration::from_secs(4), handle)
            .await
            .expect("detached write should give up after its timeout")
            .unwrap();
    }
}
