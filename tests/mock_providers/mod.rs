//! Mock collaborators for bridge integration tests
//!
//! - `MockProvider`: a scripted AI backend; the test pushes normalized events
//!   and inspects what the bridge asked of it
//! - `RecordingSink`: captures persisted call outcomes
//! - `websocket_mock`: in-process realtime WebSocket server
//! - `stt_mock`: in-process streaming STT server

#![allow(dead_code)]

pub mod stt_mock;
pub mod websocket_mock;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use waav_call_bridge::core::backpressure::BackpressureGovernor;
use waav_call_bridge::core::bridge::{BridgeOptions, CallBridge, CallStart, ProviderFactory};
use waav_call_bridge::core::codec::AudioFormat;
use waav_call_bridge::core::directory::{BusinessConfig, StaticCallDirectory};
use waav_call_bridge::core::persistence::{CallOutcome, PersistenceSink, SinkResult};
use waav_call_bridge::core::provider::{
    AiProvider, CallProfile, ConnectionState, ProviderClient, ProviderError, ProviderEvent,
    ProviderResult,
};
use waav_call_bridge::core::telephony::{TelephonyCommand, TelephonyEvent};

pub const BUSINESS_ID: &str = "dental";

/// One 20ms μ-law frame of non-silence.
pub fn mulaw_frame() -> Bytes {
    Bytes::from(vec![0x55u8; 160])
}

/// `frames` back-to-back 20ms μ-law frames as a single delta.
pub fn mulaw_audio(frames: usize) -> Bytes {
    Bytes::from(vec![0x55u8; 160 * frames])
}

pub struct MockProvider {
    events_tx: mpsc::Sender<ProviderEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ProviderEvent>>>,
    state: Mutex<ConnectionState>,
    automatic: bool,
    /// Connect attempts that fail with a transient error before succeeding.
    transient_failures: AtomicUsize,
    fatal_connect: bool,
    /// Emit `ResponseCancelled` when a cancel arrives.
    ack_cancels: bool,

    pub connects: AtomicUsize,
    pub audio_frames: AtomicUsize,
    pub responses: Mutex<Vec<Option<String>>>,
    pub cancels: Mutex<Vec<String>>,
    pub function_results: Mutex<Vec<(String, String)>>,
}

impl MockProvider {
    fn build(automatic: bool) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(ConnectionState::Disconnected),
            automatic,
            transient_failures: AtomicUsize::new(0),
            fatal_connect: false,
            ack_cancels: true,
            connects: AtomicUsize::new(0),
            audio_frames: AtomicUsize::new(0),
            responses: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            function_results: Mutex::new(Vec::new()),
        }
    }

    /// Server-VAD backend that starts responses itself.
    pub fn realtime() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    /// Backend that needs `create_response` per caller turn.
    pub fn pipeline() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    pub fn failing_transiently(times: usize) -> Arc<Self> {
        let provider = Self::build(true);
        provider.transient_failures.store(times, Ordering::SeqCst);
        Arc::new(provider)
    }

    pub fn failing_fatally() -> Arc<Self> {
        let mut provider = Self::build(true);
        provider.fatal_connect = true;
        Arc::new(provider)
    }

    pub fn without_cancel_acks() -> Arc<Self> {
        let mut provider = Self::build(true);
        provider.ack_cancels = false;
        Arc::new(provider)
    }

    pub async fn emit(&self, event: ProviderEvent) {
        self.events_tx
            .send(event)
            .await
            .expect("bridge stopped reading provider events");
    }

    /// Begin a response and stream `frames` of audio for it.
    pub async fn speak(&self, response_id: &str, frames: usize) {
        self.emit(ProviderEvent::ResponseCreated {
            response_id: response_id.to_string(),
        })
        .await;
        self.emit(ProviderEvent::AudioDelta {
            response_id: response_id.to_string(),
            audio: mulaw_audio(frames),
        })
        .await;
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().clone()
    }

    pub fn responses(&self) -> Vec<Option<String>> {
        self.responses.lock().clone()
    }

    pub fn function_results(&self) -> Vec<(String, String)> {
        self.function_results.lock().clone()
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn connect(&self) -> ProviderResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fatal_connect {
            return Err(ProviderError::AuthenticationFailed("bad key".to_string()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::ConnectionFailed("connection reset".to_string()));
        }
        *self.state.lock() = ConnectionState::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> ProviderResult<()> {
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
        AudioFormat::G711Ulaw
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::G711Ulaw
    }

    fn responds_automatically(&self) -> bool {
        self.automatic
    }

    async fn wait_ready(&self, _timeout: Duration) -> ProviderResult<()> {
        Ok(())
    }

    async fn send_audio(&self, _audio: Bytes) -> ProviderResult<()> {
        self.audio_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_response(&self, user_text: Option<String>) -> ProviderResult<()> {
        self.responses.lock().push(user_text);
        Ok(())
    }

    async fn cancel_response(&self, response_id: &str) -> ProviderResult<()> {
        self.cancels.lock().push(response_id.to_string());
        if self.ack_cancels {
            let _ = self
                .events_tx
                .send(ProviderEvent::ResponseCancelled {
                    response_id: response_id.to_string(),
                })
                .await;
        }
        Ok(())
    }

    async fn submit_function_result(&self, call_id: &str, output: &str) -> ProviderResult<()> {
        self.function_results
            .lock()
            .push((call_id.to_string(), output.to_string()));
        Ok(())
    }

    fn provider_info(&self) -> serde_json::Value {
        serde_json::json!({ "provider": "mock" })
    }
}

/// Hands out one pre-built provider.
pub struct MockFactory {
    provider: Arc<MockProvider>,
}

impl MockFactory {
    pub fn new(provider: Arc<MockProvider>) -> Arc<Self> {
        Arc::new(Self { provider })
    }
}

impl ProviderFactory for MockFactory {
    fn create(
        &self,
        _kind: AiProvider,
        _profile: &CallProfile,
        _governor: Arc<BackpressureGovernor>,
    ) -> ProviderResult<Arc<dyn ProviderClient>> {
        Ok(self.provider.clone())
    }
}

/// Collects persisted outcomes.
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<CallOutcome>,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CallOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl PersistenceSink for RecordingSink {
    async fn record(&self, outcome: &CallOutcome) -> SinkResult<()> {
        let _ = self.tx.send(outcome.clone());
        Ok(())
    }
}

pub fn business(ai_provider: AiProvider, greeting: Option<&str>) -> BusinessConfig {
    BusinessConfig {
        business_id: BUSINESS_ID.to_string(),
        ai_provider,
        voice_id: "alloy".to_string(),
        instructions: Some("You are the front desk of a dental office.".to_string()),
        greeting: greeting.map(str::to_string),
    }
}

pub fn directory(business: BusinessConfig) -> Arc<StaticCallDirectory> {
    Arc::new(StaticCallDirectory::new(
        vec![business],
        Some(BUSINESS_ID.to_string()),
    ))
}

pub fn bridge_with(
    provider: Arc<MockProvider>,
    business: BusinessConfig,
    sink: Arc<RecordingSink>,
) -> CallBridge {
    CallBridge::new(
        directory(business),
        MockFactory::new(provider),
        sink,
        BridgeOptions::default(),
    )
}

/// A running call and both ends of its telephony channel.
pub struct CallHarness {
    pub inbound: mpsc::Sender<TelephonyEvent>,
    pub commands: mpsc::Receiver<TelephonyCommand>,
    pub call: JoinHandle<CallOutcome>,
}

impl CallHarness {
    pub fn start(bridge: Arc<CallBridge>, parameters: HashMap<String, String>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(4096);
        let start = CallStart {
            call_id: "CA-integration".to_string(),
            stream_sid: "MZ-integration".to_string(),
            parameters,
        };
        let call = tokio::spawn(async move { bridge.run(start, inbound_rx, command_tx).await });
        Self {
            inbound: inbound_tx,
            commands: command_rx,
            call,
        }
    }

    /// Collect commands until `Hangup` (inclusive) or the channel closes.
    pub async fn commands_until_hangup(&mut self) -> Vec<TelephonyCommand> {
        let mut seen = Vec::new();
        while let Some(command) = self.commands.recv().await {
            let done = command == TelephonyCommand::Hangup;
            seen.push(command);
            if done {
                break;
            }
        }
        seen
    }

    /// Collect whatever is queued right now.
    pub fn drain_commands(&mut self) -> Vec<TelephonyCommand> {
        let mut seen = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            seen.push(command);
        }
        seen
    }
}

pub fn media_count(commands: &[TelephonyCommand]) -> usize {
    commands
        .iter()
        .filter(|c| matches!(c, TelephonyCommand::Media(_)))
        .count()
}
