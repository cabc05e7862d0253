//! AI provider clients.
//!
//! Two backends sit behind [`ProviderClient`]:
//!
//! - [`realtime`]: one duplex WebSocket carrying audio and JSON events
//! - [`pipeline`]: streaming speech-to-text, chat completion and
//!   text-to-speech legs driven turn by turn
//!
//! Both translate their wire traffic into [`ProviderEvent`] once, at this
//! boundary, so nothing downstream branches on provider identity.

pub mod pipeline;
pub mod realtime;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::backpressure::BackpressureGovernor;
use crate::core::codec::AudioFormat;

pub use pipeline::{PipelineClient, PipelineSettings};
pub use realtime::{RealtimeClient, RealtimeSettings};

/// Capacity of the normalized event channel between a client and its call.
pub const EVENT_CHANNEL_CAPACITY: usize = 512;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Session not confirmed within {0:?}")]
    SessionNotConfirmed(Duration),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),
}

impl ProviderError {
    /// Socket drops and rate limits are worth one fresh attempt; everything
    /// else is either a protocol hiccup or a configuration problem.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::WebSocketError(_)
                | Self::RequestFailed(_)
                | Self::Timeout(_)
                | Self::NotConnected
                | Self::RateLimitExceeded(_)
        )
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

// =============================================================================
// Provider kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    #[default]
    Realtime,
    Pipeline,
}

impl fmt::Display for AiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AiProvider::Realtime => write!(f, "realtime"),
            AiProvider::Pipeline => write!(f, "pipeline"),
        }
    }
}

impl FromStr for AiProvider {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "realtime" | "openai_realtime" => Ok(AiProvider::Realtime),
            "pipeline" | "stt_llm_tts" => Ok(AiProvider::Pipeline),
            _ => Err(ProviderError::InvalidConfiguration(format!(
                "Unsupported AI provider: {s}. Supported providers: realtime, pipeline"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// Provider traffic normalized for the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    SpeechStarted,
    SpeechStopped,
    TranscriptionCompleted { text: String },
    ResponseCreated { response_id: String },
    /// Audio in the client's output format.
    AudioDelta { response_id: String, audio: Bytes },
    AssistantTranscript { response_id: String, text: String },
    ResponseDone { response_id: String },
    ResponseCancelled { response_id: String },
    FunctionCall(FunctionCall),
    /// Non-fatal provider complaint, logged and otherwise ignored.
    Error { message: String },
    /// The connection dropped and was re-established with the session restored.
    /// `responses_lost` is set when in-flight responses died with the old
    /// connection and will never be acknowledged.
    Reconnected { attempt: u32, responses_lost: bool },
    /// The connection is gone for good.
    Closed { reason: String },
}

// =============================================================================
// Reconnection
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub enabled: bool,
    /// Attempts before giving up; 0 means unlimited.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f32,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 1,
            initial_delay_ms: 250,
            max_delay_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay in milliseconds before `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let delay = self.initial_delay_ms as f64
            * (self.backoff_multiplier as f64).powi(attempt.saturating_sub(1) as i32);
        delay.min(self.max_delay_ms as f64) as u64
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }
}

// =============================================================================
// Client trait
// =============================================================================

/// Per-call instructions for the AI.
#[derive(Debug, Clone, Default)]
pub struct CallProfile {
    pub voice_id: String,
    pub instructions: Option<String>,
    pub greeting: Option<String>,
}

/// Duplex client for one AI backend, shared by a call's loops.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn connect(&self) -> ProviderResult<()>;

    async fn disconnect(&self) -> ProviderResult<()>;

    fn connection_state(&self) -> ConnectionState;

    /// The normalized event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<ProviderEvent>>;

    /// Format expected by `send_audio`.
    fn input_format(&self) -> AudioFormat;

    /// Format of `AudioDelta` payloads.
    fn output_format(&self) -> AudioFormat;

    /// True when the backend starts responses on its own after the caller
    /// stops talking; otherwise the bridge calls `create_response` per turn.
    fn responds_automatically(&self) -> bool;

    /// Wait until the backend can accept `create_response`.
    async fn wait_ready(&self, timeout: Duration) -> ProviderResult<()>;

    async fn send_audio(&self, audio: Bytes) -> ProviderResult<()>;

    /// Start an AI turn, optionally answering `user_text`.
    async fn create_response(&self, user_text: Option<String>) -> ProviderResult<()>;

    async fn cancel_response(&self, response_id: &str) -> ProviderResult<()>;

    async fn submit_function_result(&self, call_id: &str, output: &str) -> ProviderResult<()>;

    fn provider_info(&self) -> serde_json::Value;
}

/// Backend settings shared by every call.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub realtime: RealtimeSettings,
    pub pipeline: PipelineSettings,
}

/// Build the client for `kind`.
pub fn create_provider(
    kind: AiProvider,
    settings: &ProviderSettings,
    profile: &CallProfile,
    governor: Arc<BackpressureGovernor>,
) -> ProviderResult<Arc<dyn ProviderClient>> {
    match kind {
        AiProvider::Realtime => Ok(Arc::new(RealtimeClient::new(
            settings.realtime.clone(),
            profile.clone(),
        )?)),
        AiProvider::Pipeline => Ok(Arc::new(PipelineClient::new(
            settings.pipeline.clone(),
            profile.clone(),
            governor,
        )?)),
    }
}

pub fn get_supported_providers() -> Vec<&'static str> {
    vec!["realtime", "pipeline"]
}

/// Tool offered to every backend for ending the conversation.
pub const END_CALL_TOOL: &str = "end_call";

pub(crate) fn end_call_tool_parameters() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "reason": {
                "type": "string",
                "description": "Short reason the conversation is over"
            }
        }
    })
}

pub(crate) const END_CALL_TOOL_DESCRIPTION: &str =
    "End the phone call after saying goodbye. Call this only once the caller has nothing more to discuss.";
