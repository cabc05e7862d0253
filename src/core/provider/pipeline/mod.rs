//! Pipeline variant: streaming STT, request/response LLM and streaming TTS.
//!
//! Unlike the realtime socket the pipeline has discrete turns. Each turn is
//! a spawned task that holds a [`TurnGuard`](crate::core::backpressure::TurnGuard)
//! while it generates and synthesizes, so the RX loop drops caller audio
//! for exactly that window.

mod llm;
mod stt;
mod tts;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    CallProfile, ConnectionState, EVENT_CHANNEL_CAPACITY, ProviderClient, ProviderError,
    ProviderEvent, ProviderResult, ReconnectionConfig,
};
use crate::core::backpressure::BackpressureGovernor;
use crate::core::codec::AudioFormat;

pub use llm::{AssistantReply, ChatMessage, LlmLeg, ToolCall, ToolCallFunction};
pub use stt::SttLeg;
pub use tts::{TTS_PCM_SAMPLE_RATE, TtsLeg};

pub const DEFAULT_STT_URL: &str = "wss://api.deepgram.com/v1/listen";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub stt_url: String,
    #[serde(skip_serializing)]
    pub stt_api_key: String,
    pub stt_model: String,
    pub stt_sample_rate: u32,
    pub stt_endpointing_ms: u32,

    pub llm_base_url: String,
    #[serde(skip_serializing)]
    pub llm_api_key: String,
    pub llm_model: String,
    pub temperature: Option<f32>,

    pub tts_base_url: String,
    #[serde(skip_serializing)]
    pub tts_api_key: String,
    pub tts_model: String,
    pub tts_voice: String,

    /// Bound on one LLM or TTS HTTP request.
    pub request_timeout_ms: u64,
    /// Delay before the single retry of a transient LLM or TTS failure.
    pub retry_delay_ms: u64,

    /// Applies to the STT socket.
    pub reconnection: ReconnectionConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stt_url: DEFAULT_STT_URL.to_string(),
            stt_api_key: String::new(),
            stt_model: "nova-2-phonecall".to_string(),
            stt_sample_rate: 16000,
            stt_endpointing_ms: 300,
            llm_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            llm_api_key: String::new(),
            llm_model: "gpt-4o-mini".to_string(),
            temperature: Some(0.6),
            tts_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            tts_api_key: String::new(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            request_timeout_ms: 15_000,
            retry_delay_ms: 250,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

/// Map a non-success HTTP status onto the provider error taxonomy.
pub(crate) async fn error_for_status(response: reqwest::Response) -> ProviderResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{status}: {body}");
    Err(match status.as_u16() {
        401 | 403 => ProviderError::AuthenticationFailed(detail),
        429 => ProviderError::RateLimitExceeded(detail),
        408 | 500..=599 => ProviderError::RequestFailed(detail),
        _ => ProviderError::ProviderError(detail),
    })
}

/// One retry for transient LLM/TTS failures.
const REQUEST_ATTEMPTS: u32 = 2;

/// Run `request`, retrying transient failures after `retry_delay`.
async fn with_retry<T, F, Fut>(leg: &str, retry_delay: Duration, mut request: F) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ProviderResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match request().await {
            Err(e) if e.is_transient() && attempt < REQUEST_ATTEMPTS => {
                tracing::warn!("{} request failed on attempt {}: {}; retrying", leg, attempt, e);
                tokio::time::sleep(retry_delay).await;
            }
            result => return result,
        }
    }
}

struct ActiveTurn {
    response_id: String,
    cancel: CancellationToken,
}

/// Everything a turn task needs, cloned out of the client.
#[derive(Clone)]
struct TurnContext {
    llm: LlmLeg,
    tts: TtsLeg,
    voice: String,
    retry_delay: Duration,
    history: Arc<Mutex<Vec<ChatMessage>>>,
    events: mpsc::Sender<ProviderEvent>,
    governor: Arc<BackpressureGovernor>,
}

pub struct PipelineClient {
    settings: PipelineSettings,
    profile: CallProfile,
    stt: SttLeg,
    llm: LlmLeg,
    tts: TtsLeg,
    governor: Arc<BackpressureGovernor>,
    history: Arc<Mutex<Vec<ChatMessage>>>,
    active_turn: Arc<Mutex<Option<ActiveTurn>>>,
    state: Mutex<ConnectionState>,
    events_tx: mpsc::Sender<ProviderEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ProviderEvent>>>,
    greeted: std::sync::atomic::AtomicBool,
}

impl PipelineClient {
    pub fn new(
        settings: PipelineSettings,
        profile: CallProfile,
        governor: Arc<BackpressureGovernor>,
    ) -> ProviderResult<Self> {
        if settings.stt_api_key.is_empty() {
            return Err(ProviderError::AuthenticationFailed(
                "STT API key is required".to_string(),
            ));
        }
        if settings.llm_api_key.is_empty() || settings.tts_api_key.is_empty() {
            return Err(ProviderError::AuthenticationFailed(
                "LLM and TTS API keys are required".to_string(),
            ));
        }
        AudioFormat::pcm16(settings.stt_sample_rate)
            .map_err(|e| ProviderError::InvalidConfiguration(e.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .map_err(|e| ProviderError::InvalidConfiguration(e.to_string()))?;

        let mut history = Vec::new();
        if let Some(instructions) = &profile.instructions {
            history.push(ChatMessage::system(instructions.clone()));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            stt: SttLeg::new(settings.clone()),
            llm: LlmLeg::new(http.clone(), &settings),
            tts: TtsLeg::new(http, &settings),
            settings,
            profile,
            governor,
            history: Arc::new(Mutex::new(history)),
            active_turn: Arc::new(Mutex::new(None)),
            state: Mutex::new(ConnectionState::Disconnected),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            greeted: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().clone()
    }

    pub fn is_turn_active(&self) -> bool {
        self.active_turn.lock().is_some()
    }

    fn turn_context(&self) -> TurnContext {
        TurnContext {
            llm: self.llm.clone(),
            tts: self.tts.clone(),
            voice: self.profile.voice_id.clone(),
            retry_delay: Duration::from_millis(self.settings.retry_delay_ms),
            history: Arc::clone(&self.history),
            events: self.events_tx.clone(),
            governor: Arc::clone(&self.governor),
        }
    }

    fn spawn_turn(&self, scripted: Option<String>) -> String {
        let response_id = format!("turn_{}", uuid::Uuid::new_v4().simple());
        let cancel = CancellationToken::new();

        let superseded = self.active_turn.lock().replace(ActiveTurn {
            response_id: response_id.clone(),
            cancel: cancel.clone(),
        });
        if let Some(previous) = superseded {
            tracing::debug!("Turn {} superseded by {}", previous.response_id, response_id);
            previous.cancel.cancel();
        }

        let ctx = self.turn_context();
        let active_turn = Arc::clone(&self.active_turn);
        let id = response_id.clone();

        tokio::spawn(async move {
            let _ = ctx
                .events
                .send(ProviderEvent::ResponseCreated {
                    response_id: id.clone(),
                })
                .await;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = run_turn(&ctx, &id, scripted) => Some(result),
            };

            {
                let mut active = active_turn.lock();
                if active.as_ref().is_some_and(|t| t.response_id == id) {
                    *active = None;
                }
            }

            let terminal = match outcome {
                None => {
                    tracing::debug!("Turn {} cancelled", id);
                    ProviderEvent::ResponseCancelled { response_id: id }
                }
                Some(Ok(())) => ProviderEvent::ResponseDone { response_id: id },
                Some(Err(e)) => {
                    tracing::error!("Turn {} failed: {}", id, e);
                    let _ = ctx
                        .events
                        .send(ProviderEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    ProviderEvent::ResponseDone { response_id: id }
                }
            };
            let _ = ctx.events.send(terminal).await;
        });

        response_id
    }
}

/// Generate (unless scripted) and speak one assistant turn.
async fn run_turn(ctx: &TurnContext, response_id: &str, scripted: Option<String>) -> ProviderResult<()> {
    let _guard = ctx.governor.begin_turn();

    let text = match scripted {
        Some(text) => {
            ctx.history.lock().push(ChatMessage::assistant(text.clone()));
            Some(text)
        }
        None => {
            let messages = ctx.history.lock().clone();
            let reply = with_retry("LLM", ctx.retry_delay, || ctx.llm.complete(&messages)).await?;
            if let Some(message) = reply.message.clone() {
                ctx.history.lock().push(message);
            }
            for call in reply.function_calls {
                let _ = ctx.events.send(ProviderEvent::FunctionCall(call)).await;
            }
            reply.text
        }
    };

    let Some(text) = text else {
        return Ok(());
    };

    let mut audio = with_retry("TTS", ctx.retry_delay, || ctx.tts.synthesize(&text, &ctx.voice)).await?;
    while let Some(chunk) = audio.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        let _ = ctx
            .events
            .send(ProviderEvent::AudioDelta {
                response_id: response_id.to_string(),
                audio: chunk,
            })
            .await;
    }

    let _ = ctx
        .events
        .send(ProviderEvent::AssistantTranscript {
            response_id: response_id.to_string(),
            text,
        })
        .await;
    Ok(())
}

#[async_trait]
impl ProviderClient for PipelineClient {
    async fn connect(&self) -> ProviderResult<()> {
        *self.state.lock() = ConnectionState::Connecting;
        match self.stt.connect(self.events_tx.clone()).await {
            Ok(()) => {
                *self.state.lock() = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> ProviderResult<()> {
        if let Some(turn) = self.active_turn.lock().take() {
            turn.cancel.cancel();
        }
        self.stt.close().await;
        *self.state.lock() = ConnectionState::Disconnected;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn take_events(&self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.events_rx.lock().take()
    }

    fn input_format(&self) -> AudioFormat {
        AudioFormat::Pcm16 {
            sample_rate: self.settings.stt_sample_rate,
        }
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::Pcm16 {
            sample_rate: TTS_PCM_SAMPLE_RATE,
        }
    }

    fn responds_automatically(&self) -> bool {
        false
    }

    async fn wait_ready(&self, _timeout: Duration) -> ProviderResult<()> {
        if self.stt.is_connected().await {
            Ok(())
        } else {
            Err(ProviderError::NotConnected)
        }
    }

    async fn send_audio(&self, audio: Bytes) -> ProviderResult<()> {
        self.stt.send_audio(audio).await
    }

    async fn create_response(&self, user_text: Option<String>) -> ProviderResult<()> {
        use std::sync::atomic::Ordering;

        let scripted = match user_text.filter(|t| !t.trim().is_empty()) {
            Some(text) => {
                self.history.lock().push(ChatMessage::user(text));
                None
            }
            None if !self.greeted.swap(true, Ordering::AcqRel) => self.profile.greeting.clone(),
            None => None,
        };

        let id = self.spawn_turn(scripted);
        tracing::debug!("Started pipeline turn {}", id);
        Ok(())
    }

    async fn cancel_response(&self, response_id: &str) -> ProviderResult<()> {
        let active = self.active_turn.lock();
        match active.as_ref() {
            Some(turn) if turn.response_id == response_id => {
                turn.cancel.cancel();
                Ok(())
            }
            _ => Err(ProviderError::ProviderError(format!(
                "no active turn {response_id}"
            ))),
        }
    }

    async fn submit_function_result(&self, call_id: &str, output: &str) -> ProviderResult<()> {
        self.history.lock().push(ChatMessage::tool_result(call_id, output));
        Ok(())
    }

    fn provider_info(&self) -> serde_json::Value {
        serde_json::json!({
            "provider": "pipeline",
            "stt_model": self.settings.stt_model,
            "llm_model": self.settings.llm_model,
            "tts_model": self.settings.tts_model,
        })
    }
}
