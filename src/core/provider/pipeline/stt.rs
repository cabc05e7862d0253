//! Streaming speech-to-text leg (Deepgram-compatible live transcription).
//!
//! - Endpoint: `wss://api.deepgram.com/v1/listen`
//! - Audio in: binary linear16 frames
//! - Out: `Results` (interim/final), `SpeechStarted`, `UtteranceEnd`
//!
//! Final segments are accumulated until the endpointer reports
//! `speech_final` (or an `UtteranceEnd` arrives) and are then released as a
//! single transcription.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use url::form_urlencoded;

use super::PipelineSettings;
use crate::core::provider::{ProviderError, ProviderEvent, ProviderResult};

/// Keeps the stream open while caller audio is being dropped mid-turn.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const AUDIO_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum SttMessage {
    Results {
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
        channel: SttChannel,
    },
    SpeechStarted {},
    UtteranceEnd {},
    Metadata {},
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SttChannel {
    #[serde(default)]
    alternatives: Vec<SttAlternative>,
}

#[derive(Debug, Deserialize)]
struct SttAlternative {
    #[serde(default)]
    transcript: String,
}

enum Outgoing {
    Audio(Bytes),
    Close,
}

/// Assembles final segments into utterances.
#[derive(Debug, Default)]
pub(crate) struct UtteranceAssembler {
    segments: Vec<String>,
    speech_open: bool,
}

impl UtteranceAssembler {
    pub(crate) fn handle(&mut self, message: SttMessage) -> Vec<ProviderEvent> {
        match message {
            SttMessage::SpeechStarted {} => {
                self.speech_open = true;
                vec![ProviderEvent::SpeechStarted]
            }
            SttMessage::Results {
                is_final,
                speech_final,
                channel,
            } => {
                if is_final
                    && let Some(alt) = channel.alternatives.first()
                    && !alt.transcript.trim().is_empty()
                {
                    self.segments.push(alt.transcript.trim().to_string());
                }
                if speech_final {
                    self.release()
                } else {
                    Vec::new()
                }
            }
            SttMessage::UtteranceEnd {} => self.release(),
            SttMessage::Metadata {} | SttMessage::Unknown => Vec::new(),
        }
    }

    /// Emit the utterance. A speech start that produced no words still gets
    /// an (empty) transcription so a pending barge-in can be rejected.
    fn release(&mut self) -> Vec<ProviderEvent> {
        if self.segments.is_empty() && !self.speech_open {
            return Vec::new();
        }
        self.speech_open = false;
        let text = std::mem::take(&mut self.segments).join(" ");
        vec![
            ProviderEvent::SpeechStopped,
            ProviderEvent::TranscriptionCompleted { text },
        ]
    }
}

pub struct SttLeg {
    settings: PipelineSettings,
    sender: Arc<Mutex<Option<mpsc::Sender<Outgoing>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SttLeg {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            sender: Arc::new(Mutex::new(None)),
            handle: Mutex::new(None),
        }
    }

    pub fn ws_url(&self) -> String {
        let sample_rate = self.settings.stt_sample_rate.to_string();
        let endpointing = self.settings.stt_endpointing_ms.to_string();
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("model", &self.settings.stt_model)
            .append_pair("encoding", "linear16")
            .append_pair("sample_rate", &sample_rate)
            .append_pair("channels", "1")
            .append_pair("interim_results", "true")
            .append_pair("vad_events", "true")
            .append_pair("endpointing", &endpointing)
            .append_pair("utterance_end_ms", "1000")
            .append_pair("punctuate", "true")
            .finish();
        format!("{}?{}", self.settings.stt_url, query)
    }

    async fn open_socket(settings: &PipelineSettings, url: &str) -> ProviderResult<WsStream> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", settings.stt_api_key))
            .map_err(|e| ProviderError::InvalidConfiguration(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;
        Ok(ws_stream)
    }

    pub async fn connect(&self, events: mpsc::Sender<ProviderEvent>) -> ProviderResult<()> {
        let url = self.ws_url();
        let ws_stream = Self::open_socket(&self.settings, &url).await?;
        tracing::info!("Connected to streaming STT at {}", self.settings.stt_url);

        let (sink, stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Outgoing>(AUDIO_CHANNEL_CAPACITY);
        *self.sender.lock().await = Some(tx);
        let sender = Arc::clone(&self.sender);
        let settings = self.settings.clone();

        let handle = tokio::spawn(async move {
            let mut sink = sink;
            let mut stream = stream;
            let mut attempt: u32 = 0;
            let reconnection = settings.reconnection.clone();

            'outer: loop {
                // A partial utterance does not survive the socket that heard it.
                let mut assembler = UtteranceAssembler::default();
                let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
                keepalive.tick().await;

                let reason = loop {
                    tokio::select! {
                        outgoing = rx.recv() => {
                            let message = match outgoing {
                                Some(Outgoing::Audio(audio)) => Message::Binary(audio),
                                Some(Outgoing::Close) | None => {
                                    let _ = sink.send(Message::Text(r#"{"type":"CloseStream"}"#.into())).await;
                                    return;
                                }
                            };
                            if let Err(e) = sink.send(message).await {
                                break format!("STT send failed: {e}");
                            }
                        }

                        _ = keepalive.tick() => {
                            if let Err(e) = sink.send(Message::Text(r#"{"type":"KeepAlive"}"#.into())).await {
                                break format!("STT keepalive failed: {e}");
                            }
                        }

                        msg = stream.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<SttMessage>(&text) {
                                        Ok(message) => {
                                            for event in assembler.handle(message) {
                                                if events.send(event).await.is_err() {
                                                    return;
                                                }
                                            }
                                        }
                                        Err(e) => tracing::warn!("Failed to parse STT message: {}", e),
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = sink.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => break "STT stream closed".to_string(),
                                Some(Err(e)) => break format!("STT socket error: {e}"),
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                };
                tracing::warn!("{}", reason);

                loop {
                    if !reconnection.should_retry(attempt) {
                        tracing::warn!("STT connection lost after {} reconnection attempts", attempt);
                        *sender.lock().await = None;
                        let _ = events.send(ProviderEvent::Closed { reason }).await;
                        break 'outer;
                    }
                    attempt += 1;
                    let delay_ms = reconnection.calculate_delay(attempt);
                    tracing::info!("Attempting STT reconnection {} in {}ms", attempt, delay_ms);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                    // closed by the caller while we were waiting
                    if sender.lock().await.is_none() {
                        return;
                    }

                    match Self::open_socket(&settings, &url).await {
                        Ok(ws) => {
                            let (new_sink, new_stream) = ws.split();
                            sink = new_sink;
                            stream = new_stream;
                            tracing::info!("Reconnected to streaming STT");
                            // turns run over HTTP and are unaffected
                            let _ = events
                                .send(ProviderEvent::Reconnected {
                                    attempt,
                                    responses_lost: false,
                                })
                                .await;
                            continue 'outer;
                        }
                        Err(e) => tracing::error!("STT reconnection attempt {} failed: {}", attempt, e),
                    }
                }
            }
        });

        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    pub async fn send_audio(&self, audio: Bytes) -> ProviderResult<()> {
        let sender = self.sender.lock().await;
        let Some(tx) = sender.as_ref() else {
            return Err(ProviderError::NotConnected);
        };
        tx.send(Outgoing::Audio(audio))
            .await
            .map_err(|e| ProviderError::WebSocketError(e.to_string()))
    }

    pub async fn close(&self) {
        if let Some(tx) = self.sender.lock().await.take() {
            let _ = tx.send(Outgoing::Close).await;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            // give CloseStream a moment to flush, then stop waiting
            if tokio::time::timeout(Duration::from_millis(500), handle).await.is_err() {
                tracing::debug!("STT task did not finish after CloseStream");
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.sender.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> SttMessage {
        serde_json::from_str(raw).unwrap()
    }

    fn results(text: &str, is_final: bool, speech_final: bool) -> SttMessage {
        parse(&format!(
            r#"{{"type":"Results","is_final":{is_final},"speech_final":{speech_final},"channel":{{"alternatives":[{{"transcript":"{text}","confidence":0.9}}]}}}}"#
        ))
    }

    #[test]
    fn test_finals_joined_on_speech_final() {
        let mut assembler = UtteranceAssembler::default();
        assert_eq!(
            assembler.handle(parse(r#"{"type":"SpeechStarted","channel":[0],"timestamp":1.2}"#)),
            vec![ProviderEvent::SpeechStarted]
        );
        assert!(assembler.handle(results("I'd like", false, false)).is_empty());
        assert!(assembler.handle(results("I'd like to", true, false)).is_empty());
        let events = assembler.handle(results("book a cleaning", true, true));
        assert_eq!(
            events.last(),
            Some(&ProviderEvent::TranscriptionCompleted {
                text: "I'd like to book a cleaning".to_string()
            })
        );
    }

    #[test]
    fn test_speech_without_words_yields_empty_transcription() {
        let mut assembler = UtteranceAssembler::default();
        assembler.handle(parse(r#"{"type":"SpeechStarted"}"#));
        let events = assembler.handle(parse(r#"{"type":"UtteranceEnd","last_word_end":2.1}"#));
        assert_eq!(
            events.last(),
            Some(&ProviderEvent::TranscriptionCompleted { text: String::new() })
        );
        // nothing pending afterwards
        assert!(assembler.handle(parse(r#"{"type":"UtteranceEnd"}"#)).is_empty());
    }

    #[test]
    fn test_unknown_messages_ignored() {
        let mut assembler = UtteranceAssembler::default();
        assert!(assembler.handle(parse(r#"{"type":"Warning","description":"x"}"#)).is_empty());
    }

    #[test]
    fn test_ws_url_includes_vad_events() {
        let leg = SttLeg::new(PipelineSettings::default());
        let url = leg.ws_url();
        assert!(url.contains("vad_events=true"));
        assert!(url.contains("sample_rate=16000"));
    }
}
