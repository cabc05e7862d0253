//! Realtime socket client.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::messages::{
    ClientEvent, ConversationItem, InputAudioTranscription, ServerEvent, SessionConfig, ToolDef,
    TurnDetection,
};
use super::{RealtimeSettings, SessionGate};
use crate::core::codec::AudioFormat;
use crate::core::provider::{
    CallProfile, ConnectionState, END_CALL_TOOL, END_CALL_TOOL_DESCRIPTION,
    EVENT_CHANNEL_CAPACITY, FunctionCall, ProviderClient, ProviderError, ProviderEvent,
    ProviderResult, end_call_tool_parameters,
};

/// Channel capacity for outgoing socket messages.
const WS_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Realtime provider client.
///
/// All mutable state is behind `Arc` so the spawned socket task and the
/// call's loops can share it. Sending never blocks on the socket itself:
/// events go through a bounded channel drained by the socket task.
pub struct RealtimeClient {
    settings: RealtimeSettings,
    profile: CallProfile,
    state: Arc<parking_lot::RwLock<ConnectionState>>,
    gate: Arc<SessionGate>,
    ws_sender: Arc<Mutex<Option<mpsc::Sender<ClientEvent>>>>,
    events_tx: mpsc::Sender<ProviderEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::Receiver<ProviderEvent>>>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
    intentional_disconnect: Arc<AtomicBool>,
    last_session_config: Arc<parking_lot::RwLock<Option<SessionConfig>>>,
}

impl RealtimeClient {
    pub fn new(settings: RealtimeSettings, profile: CallProfile) -> ProviderResult<Self> {
        if settings.api_key.is_empty() {
            return Err(ProviderError::AuthenticationFailed(
                "API key is required".to_string(),
            ));
        }
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            settings,
            profile,
            state: Arc::new(parking_lot::RwLock::new(ConnectionState::Disconnected)),
            gate: Arc::new(SessionGate::new()),
            ws_sender: Arc::new(Mutex::new(None)),
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            connection_handle: Mutex::new(None),
            intentional_disconnect: Arc::new(AtomicBool::new(false)),
            last_session_config: Arc::new(parking_lot::RwLock::new(None)),
        })
    }

    pub fn session_gate(&self) -> Arc<SessionGate> {
        Arc::clone(&self.gate)
    }

    /// Session configuration applied right after connecting.
    pub fn build_session_config(&self) -> SessionConfig {
        let format = self.settings.audio_format.wire_name().to_string();
        let mut instructions = self.profile.instructions.clone().unwrap_or_default();
        if let Some(greeting) = &self.profile.greeting {
            if !instructions.is_empty() {
                instructions.push_str("\n\n");
            }
            instructions.push_str(&format!("Open the call by saying: {greeting}"));
        }

        SessionConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: (!instructions.is_empty()).then_some(instructions),
            voice: (!self.profile.voice_id.is_empty()).then(|| self.profile.voice_id.clone()),
            input_audio_format: Some(format.clone()),
            output_audio_format: Some(format),
            input_audio_transcription: Some(InputAudioTranscription {
                model: self.settings.transcription_model.clone(),
            }),
            turn_detection: Some(TurnDetection::ServerVad {
                threshold: self.settings.vad_threshold,
                prefix_padding_ms: self.settings.vad_prefix_padding_ms,
                silence_duration_ms: self.settings.vad_silence_duration_ms,
                create_response: Some(true),
                interrupt_response: Some(false),
            }),
            tools: Some(vec![ToolDef {
                tool_type: "function".to_string(),
                name: END_CALL_TOOL.to_string(),
                description: Some(END_CALL_TOOL_DESCRIPTION.to_string()),
                parameters: Some(end_call_tool_parameters()),
            }]),
            tool_choice: Some("auto".to_string()),
            temperature: self.settings.temperature,
        }
    }

    async fn open_socket(settings: &RealtimeSettings) -> ProviderResult<WsStream> {
        let mut request = settings
            .ws_url()
            .into_client_request()
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", settings.api_key))
            .map_err(|e| ProviderError::InvalidConfiguration(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;
        Ok(ws_stream)
    }

    async fn send_event(&self, event: ClientEvent) -> ProviderResult<()> {
        let sender = self.ws_sender.lock().await;
        let Some(tx) = sender.as_ref() else {
            return Err(ProviderError::NotConnected);
        };
        tx.send(event)
            .await
            .map_err(|e| ProviderError::WebSocketError(e.to_string()))
    }

    /// Translate one server event, forwarding anything the bridge cares about.
    async fn handle_server_event(
        event: ServerEvent,
        gate: &SessionGate,
        events: &mpsc::Sender<ProviderEvent>,
        pending_function_calls: &mut HashMap<String, String>,
    ) {
        let normalized = match event {
            ServerEvent::SessionCreated { session } => {
                tracing::debug!("Realtime session created: {} (baseline, unconfirmed)", session.id);
                gate.mark_created();
                None
            }
            ServerEvent::SessionUpdated { session } => {
                tracing::info!("Realtime session confirmed: {}", session.id);
                gate.mark_confirmed();
                None
            }
            ServerEvent::Error { error } => {
                if error.is_benign_cancel_race() {
                    tracing::debug!("Ignoring benign cancel error: {}", error.message);
                } else {
                    tracing::warn!("Realtime error: {} - {}", error.error_type, error.message);
                }
                Some(ProviderEvent::Error {
                    message: format!("{}: {}", error.error_type, error.message),
                })
            }
            ServerEvent::SpeechStarted { audio_start_ms, .. } => {
                tracing::debug!("Speech started at {}ms", audio_start_ms);
                Some(ProviderEvent::SpeechStarted)
            }
            ServerEvent::SpeechStopped { .. } => Some(ProviderEvent::SpeechStopped),
            ServerEvent::TranscriptionCompleted { transcript, .. } => {
                Some(ProviderEvent::TranscriptionCompleted { text: transcript })
            }
            // A failed transcription confirms nothing, which is what an empty one says.
            ServerEvent::TranscriptionFailed { error, .. } => {
                tracing::warn!("Input transcription failed: {}", error.message);
                Some(ProviderEvent::TranscriptionCompleted {
                    text: String::new(),
                })
            }
            ServerEvent::ResponseCreated { response } => Some(ProviderEvent::ResponseCreated {
                response_id: response.id,
            }),
            ServerEvent::AudioDelta {
                response_id, delta, ..
            } => match BASE64_STANDARD.decode(&delta) {
                Ok(audio) => Some(ProviderEvent::AudioDelta {
                    response_id,
                    audio: Bytes::from(audio),
                }),
                Err(e) => {
                    tracing::error!("Failed to decode audio delta: {}", e);
                    None
                }
            },
            ServerEvent::AudioTranscriptDone {
                response_id,
                transcript,
            } => Some(ProviderEvent::AssistantTranscript {
                response_id,
                text: transcript,
            }),
            ServerEvent::OutputItemAdded { item, .. } => {
                if item.item_type == "function_call"
                    && let (Some(call_id), Some(name)) = (item.call_id, item.name)
                {
                    pending_function_calls.insert(call_id, name);
                }
                None
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
                ..
            } => {
                let tracked = pending_function_calls.remove(&call_id);
                let name = name.or(tracked).unwrap_or_default();
                Some(ProviderEvent::FunctionCall(FunctionCall {
                    call_id,
                    name,
                    arguments,
                }))
            }
            ServerEvent::ResponseDone { response } => {
                if response.was_cancelled() {
                    Some(ProviderEvent::ResponseCancelled {
                        response_id: response.id,
                    })
                } else {
                    Some(ProviderEvent::ResponseDone {
                        response_id: response.id,
                    })
                }
            }
            ServerEvent::Unknown => {
                tracing::trace!("Unhandled realtime event");
                None
            }
        };

        if let Some(event) = normalized
            && events.send(event).await.is_err()
        {
            tracing::debug!("Event receiver dropped");
        }
    }
}

#[async_trait]
impl ProviderClient for RealtimeClient {
    async fn connect(&self) -> ProviderResult<()> {
        if *self.state.read() == ConnectionState::Connected {
            return Ok(());
        }
        self.intentional_disconnect.store(false, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Connecting;
        self.gate.reset();

        let ws_stream = match Self::open_socket(&self.settings).await {
            Ok(ws) => ws,
            Err(e) => {
                *self.state.write() = ConnectionState::Failed;
                return Err(e);
            }
        };
        tracing::info!("Connected to realtime provider at {}", self.settings.url);

        let (ws_sink, ws_stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<ClientEvent>(WS_CHANNEL_CAPACITY);
        *self.ws_sender.lock().await = Some(tx);
        *self.state.write() = ConnectionState::Connected;

        let settings = self.settings.clone();
        let state = Arc::clone(&self.state);
        let gate = Arc::clone(&self.gate);
        let events = self.events_tx.clone();
        let ws_sender = Arc::clone(&self.ws_sender);
        let intentional_disconnect = Arc::clone(&self.intentional_disconnect);
        let last_session_config = Arc::clone(&self.last_session_config);

        let handle = tokio::spawn(async move {
            let mut sink = ws_sink;
            let mut stream = ws_stream;
            let mut pending_function_calls = HashMap::new();
            let mut attempt: u32 = 0;
            let reconnection = settings.reconnection.clone();

            'outer: loop {
                loop {
                    tokio::select! {
                        Some(event) = rx.recv() => {
                            let json = match serde_json::to_string(&event) {
                                Ok(j) => j,
                                Err(e) => {
                                    tracing::error!("Failed to serialize event: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(json.into())).await {
                                tracing::error!("Failed to send WebSocket message: {}", e);
                                break;
                            }
                        }

                        msg = stream.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<ServerEvent>(&text) {
                                        Ok(event) => {
                                            Self::handle_server_event(
                                                event,
                                                &gate,
                                                &events,
                                                &mut pending_function_calls,
                                            ).await;
                                        }
                                        Err(e) => {
                                            tracing::warn!("Failed to parse server event: {} - {}", e, text);
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    if let Err(e) = sink.send(Message::Pong(data)).await {
                                        tracing::error!("Failed to send pong: {}", e);
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    tracing::info!("Realtime socket closed by server");
                                    break;
                                }
                                Some(Err(e)) => {
                                    tracing::error!("WebSocket error: {}", e);
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                }

                if intentional_disconnect.load(Ordering::SeqCst) {
                    *state.write() = ConnectionState::Disconnected;
                    break 'outer;
                }

                // The session is not valid again until the restored config is acknowledged.
                gate.reset();

                loop {
                    if !reconnection.should_retry(attempt) {
                        tracing::warn!("Realtime connection lost after {} reconnection attempts", attempt);
                        *state.write() = ConnectionState::Failed;
                        let _ = events
                            .send(ProviderEvent::Closed {
                                reason: "provider unavailable".to_string(),
                            })
                            .await;
                        break 'outer;
                    }
                    attempt += 1;
                    *state.write() = ConnectionState::Reconnecting;
                    let delay_ms = reconnection.calculate_delay(attempt);
                    tracing::info!("Attempting realtime reconnection {} in {}ms", attempt, delay_ms);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                    if intentional_disconnect.load(Ordering::SeqCst) {
                        *state.write() = ConnectionState::Disconnected;
                        break 'outer;
                    }

                    match Self::open_socket(&settings).await {
                        Ok(ws) => {
                            let (new_sink, new_stream) = ws.split();
                            sink = new_sink;
                            stream = new_stream;
                            pending_function_calls.clear();

                            let saved = last_session_config.read().clone();
                            if let Some(session) = saved
                                && let Ok(json) = serde_json::to_string(&ClientEvent::SessionUpdate { session })
                                && let Err(e) = sink.send(Message::Text(json.into())).await
                            {
                                tracing::error!("Failed to restore session after reconnection: {}", e);
                                continue;
                            }

                            *state.write() = ConnectionState::Connected;
                            tracing::info!("Reconnected to realtime provider");
                            let _ = events
                                .send(ProviderEvent::Reconnected {
                                    attempt,
                                    responses_lost: true,
                                })
                                .await;
                            continue 'outer;
                        }
                        Err(e) => {
                            tracing::error!("Reconnection attempt {} failed: {}", attempt, e);
                        }
                    }
                }
            }

            *ws_sender.lock().await = None;
        });

        *self.connection_handle.lock().await = Some(handle);

        let session = self.build_session_config();
        *self.last_session_config.write() = Some(session.clone());
        self.send_event(ClientEvent::SessionUpdate { session }).await?;

        Ok(())
    }

    async fn disconnect(&self) -> ProviderResult<()> {
        self.intentional_disconnect.store(true, Ordering::SeqCst);
        *self.ws_sender.lock().await = None;
        if let Some(handle) = self.connection_handle.lock().await.take() {
            handle.abort();
        }
        *self.state.write() = ConnectionState::Disconnected;
        self.gate.reset();
        tracing::info!("Disconnected from realtime provider");
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn take_events(&self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.events_rx.lock().take()
    }

    fn input_format(&self) -> AudioFormat {
        self.settings.audio_format
    }

    fn output_format(&self) -> AudioFormat {
        self.settings.audio_format
    }

    fn responds_automatically(&self) -> bool {
        true
    }

    async fn wait_ready(&self, timeout: Duration) -> ProviderResult<()> {
        self.gate.wait_confirmed(timeout).await
    }

    async fn send_audio(&self, audio: Bytes) -> ProviderResult<()> {
        self.send_event(ClientEvent::audio_append(&audio)).await
    }

    /// Blocks until the session is confirmed; a response requested against
    /// the baseline session would use the server's default audio format.
    async fn create_response(&self, user_text: Option<String>) -> ProviderResult<()> {
        self.gate
            .wait_confirmed(self.settings.session_confirm_timeout())
            .await?;

        if let Some(text) = user_text.filter(|t| !t.trim().is_empty()) {
            self.send_event(ClientEvent::ConversationItemCreate {
                item: ConversationItem::user_text(&text),
            })
            .await?;
        }
        self.send_event(ClientEvent::ResponseCreate { response: None })
            .await
    }

    async fn cancel_response(&self, response_id: &str) -> ProviderResult<()> {
        tracing::debug!("Cancelling realtime response {}", response_id);
        self.send_event(ClientEvent::ResponseCancel {
            response_id: Some(response_id.to_string()),
        })
        .await
    }

    async fn submit_function_result(&self, call_id: &str, output: &str) -> ProviderResult<()> {
        self.send_event(ClientEvent::ConversationItemCreate {
            item: ConversationItem::function_output(call_id, output),
        })
        .await
    }

    fn provider_info(&self) -> serde_json::Value {
        serde_json::json!({
            "provider": "realtime",
            "model": self.settings.model,
            "audio_format": self.settings.audio_format.wire_name(),
            "session_confirmed": self.gate.is_confirmed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RealtimeSettings {
        RealtimeSettings {
            api_key: "sk-test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_api_key() {
        let result = RealtimeClient::new(RealtimeSettings::default(), CallProfile::default());
        assert!(matches!(result, Err(ProviderError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_events_taken_once() {
        let client = RealtimeClient::new(settings(), CallProfile::default()).unwrap();
        assert!(client.take_events().is_some());
        assert!(client.take_events().is_none());
    }

    #[tokio::test]
    async fn test_send_audio_when_not_connected() {
        let client = RealtimeClient::new(settings(), CallProfile::default()).unwrap();
        let result = client.send_audio(Bytes::from_static(&[0xFF; 160])).await;
        assert_eq!(result, Err(ProviderError::NotConnected));
    }

    #[test]
    fn test_session_config_carries_profile() {
        let profile = CallProfile {
            voice_id: "verse".to_string(),
            instructions: Some("You book dental appointments.".to_string()),
            greeting: Some("Hi, thanks for calling!".to_string()),
        };
        let client = RealtimeClient::new(settings(), profile).unwrap();
        let config = client.build_session_config();
        assert_eq!(config.voice.as_deref(), Some("verse"));
        assert_eq!(config.input_audio_format.as_deref(), Some("g711_ulaw"));
        let instructions = config.instructions.unwrap();
        assert!(instructions.starts_with("You book dental appointments."));
        assert!(instructions.contains("Hi, thanks for calling!"));
        assert_eq!(config.tools.unwrap()[0].name, END_CALL_TOOL);
    }

    #[tokio::test]
    async fn test_translation_of_response_lifecycle() {
        let gate = SessionGate::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut pending = HashMap::new();

        for raw in [
            r#"{"type":"response.created","response":{"id":"resp_1","status":"in_progress"}}"#,
            r#"{"type":"response.audio.delta","response_id":"resp_1","item_id":"i1","delta":"/w=="}"#,
            r#"{"type":"response.output_item.added","response_id":"resp_1","item":{"type":"function_call","call_id":"c1","name":"lookup_invoice"}}"#,
            r#"{"type":"response.function_call_arguments.done","call_id":"c1","arguments":"{}"}"#,
            r#"{"type":"response.done","response":{"id":"resp_1","status":"cancelled"}}"#,
        ] {
            let event: ServerEvent = serde_json::from_str(raw).unwrap();
            RealtimeClient::handle_server_event(event, &gate, &tx, &mut pending).await;
        }

        assert_eq!(
            rx.recv().await,
            Some(ProviderEvent::ResponseCreated { response_id: "resp_1".into() })
        );
        assert_eq!(
            rx.recv().await,
            Some(ProviderEvent::AudioDelta {
                response_id: "resp_1".into(),
                audio: Bytes::from_static(&[0xFF]),
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(ProviderEvent::FunctionCall(FunctionCall {
                call_id: "c1".into(),
                name: "lookup_invoice".into(),
                arguments: "{}".into(),
            }))
        );
        assert_eq!(
            rx.recv().await,
            Some(ProviderEvent::ResponseCancelled { response_id: "resp_1".into() })
        );
    }
}
