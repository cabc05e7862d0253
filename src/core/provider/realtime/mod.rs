//! Realtime variant: one duplex socket carrying audio and JSON events.
//!
//! - Endpoint: `wss://api.openai.com/v1/realtime?model=<model>`
//! - Audio: `g711_ulaw` passthrough or `pcm16` at 24 kHz, base64 encoded
//!
//! The server announces a baseline `session.created` immediately on connect.
//! Only the later `session.updated`, sent once our `session.update` has been
//! applied, confirms the session; see [`SessionGate`].

mod client;
pub mod messages;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

use super::{ProviderError, ProviderResult, ReconnectionConfig};
use crate::core::codec::AudioFormat;

pub use client::RealtimeClient;

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub url: String,
    pub model: String,
    pub audio_format: AudioFormat,
    pub transcription_model: String,
    pub vad_threshold: Option<f32>,
    pub vad_silence_duration_ms: Option<u32>,
    pub vad_prefix_padding_ms: Option<u32>,
    pub temperature: Option<f32>,
    /// Upper bound on waiting for `session.updated`.
    pub session_confirm_timeout_ms: u64,
    pub reconnection: ReconnectionConfig,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: DEFAULT_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            audio_format: AudioFormat::G711Ulaw,
            transcription_model: "whisper-1".to_string(),
            vad_threshold: Some(0.5),
            vad_silence_duration_ms: Some(500),
            vad_prefix_padding_ms: Some(300),
            temperature: None,
            session_confirm_timeout_ms: 5000,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

impl RealtimeSettings {
    pub fn session_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.session_confirm_timeout_ms)
    }

    pub fn ws_url(&self) -> String {
        format!("{}?model={}", self.url.trim_end_matches('/'), self.model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Socket open, nothing heard yet.
    Opening,
    /// Baseline `session.created` seen; our configuration is not applied yet.
    Created,
    /// `session.updated` seen; responses may be requested.
    Confirmed,
}

/// One-shot confirmation latch for a realtime session.
///
/// Waiters block on a watch channel and are woken once per phase change;
/// nothing polls.
#[derive(Debug)]
pub struct SessionGate {
    phase: watch::Sender<SessionPhase>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGate {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(SessionPhase::Opening);
        Self { phase }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn is_confirmed(&self) -> bool {
        self.phase() == SessionPhase::Confirmed
    }

    /// Record the baseline session. Never confirms.
    pub fn mark_created(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == SessionPhase::Opening {
                *phase = SessionPhase::Created;
                true
            } else {
                false
            }
        });
    }

    pub fn mark_confirmed(&self) {
        self.phase.send_replace(SessionPhase::Confirmed);
    }

    /// Back to unconfirmed, e.g. after a reconnect.
    pub fn reset(&self) {
        self.phase.send_replace(SessionPhase::Opening);
    }

    pub async fn wait_confirmed(&self, timeout: Duration) -> ProviderResult<()> {
        let mut rx = self.phase.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|p| *p == SessionPhase::Confirmed)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ProviderError::NotConnected),
            Err(_) => Err(ProviderError::SessionNotConfirmed(timeout)),
        }
    }
}
