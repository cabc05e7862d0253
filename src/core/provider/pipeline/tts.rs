//! Speech synthesis leg: OpenAI-compatible `audio/speech`, streamed as raw PCM16.

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;

use super::{PipelineSettings, error_for_status};
use crate::core::provider::{ProviderError, ProviderResult};

/// The speech endpoint's `pcm` format is fixed at 24 kHz.
pub const TTS_PCM_SAMPLE_RATE: u32 = 24000;

#[derive(Debug, Clone)]
pub struct TtsLeg {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    default_voice: String,
}

impl TtsLeg {
    pub fn new(client: reqwest::Client, settings: &PipelineSettings) -> Self {
        Self {
            client,
            url: format!("{}/audio/speech", settings.tts_base_url.trim_end_matches('/')),
            api_key: settings.tts_api_key.clone(),
            model: settings.tts_model.clone(),
            default_voice: settings.tts_voice.clone(),
        }
    }

    /// Start synthesis and return the audio as it arrives.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
    ) -> ProviderResult<BoxStream<'static, ProviderResult<Bytes>>> {
        let voice = if voice.is_empty() {
            self.default_voice.as_str()
        } else {
            voice
        };
        let body = json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "response_format": "pcm",
        });

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        let response = error_for_status(response).await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProviderError::RequestFailed(e.to_string())))
            .boxed())
    }
}
