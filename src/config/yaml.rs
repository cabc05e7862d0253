use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use super::SlotStoreBackend;
use crate::core::codec::AudioFormat;
use crate::core::directory::BusinessConfig;
use crate::core::hangup::DrainConfig;

/// Complete YAML configuration structure
///
/// Every field is optional; anything left out keeps its environment or
/// default value.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///   start_timeout_ms: 10000
///
/// providers:
///   openai_api_key: "sk-..."
///   deepgram_api_key: "dg-..."
///
/// realtime:
///   model: "gpt-4o-realtime-preview"
///   audio_format: "g711_ulaw"
///   session_confirm_timeout_ms: 5000
///
/// pipeline:
///   stt_model: "nova-2-phonecall"
///   llm_model: "gpt-4o-mini"
///   tts_model: "tts-1"
///
/// bridge:
///   interrupt_lock_ms: 1500
///   tx_lead_ms: 100
///
/// drain:
///   safety_buffer_ms: 400
///   provider_queue_bound_ms: 30000
///   tx_queue_bound_ms: 60000
///   playback_buffer_ms: 500
///
/// outbound:
///   store: "postgres"
///   database_url: "postgres://bridge@localhost/bridge"
///   default_capacity: 3
///   capacities:
///     big-clinic: 10
///   lease_ttl_ms: 30000
///
/// directory:
///   default_business: "dental"
///   businesses:
///     - business_id: "dental"
///       ai_provider: "realtime"
///       voice_id: "alloy"
///       instructions: "You book dental appointments."
///       greeting: "Thanks for calling Bright Smiles!"
///
/// persistence:
///   webhook_url: "https://crm.example.com/call-outcomes"
///   timeout_ms: 3000
///
/// apology:
///   wav_path: "/etc/bridge/apology.wav"
///
/// security:
///   max_websocket_connections: 500
///   max_connections_per_ip: 100
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub providers: Option<ProvidersYaml>,
    pub realtime: Option<RealtimeYaml>,
    pub pipeline: Option<PipelineYaml>,
    pub bridge: Option<BridgeYaml>,
    pub drain: Option<DrainConfig>,
    pub outbound: Option<OutboundYaml>,
    pub directory: Option<DirectoryYaml>,
    pub persistence: Option<PersistenceYaml>,
    pub apology: Option<ApologyYaml>,
    pub security: Option<SecurityYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
    pub start_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsYaml {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersYaml {
    pub openai_api_key: Option<String>,
    pub deepgram_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub url: Option<String>,
    pub model: Option<String>,
    pub audio_format: Option<String>,
    pub transcription_model: Option<String>,
    pub vad_threshold: Option<f32>,
    pub vad_silence_duration_ms: Option<u32>,
    pub session_confirm_timeout_ms: Option<u64>,
    pub reconnect_attempts: Option<u32>,
}

impl RealtimeYaml {
    pub fn parsed_audio_format(&self) -> Result<Option<AudioFormat>, String> {
        self.audio_format
            .as_deref()
            .map(|raw| raw.parse::<AudioFormat>().map_err(|e| e.to_string()))
            .transpose()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineYaml {
    pub stt_url: Option<String>,
    pub stt_model: Option<String>,
    pub stt_sample_rate: Option<u32>,
    pub stt_endpointing_ms: Option<u32>,
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub tts_base_url: Option<String>,
    pub tts_model: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BridgeYaml {
    pub interrupt_lock_ms: Option<u64>,
    pub cancel_ack_timeout_ms: Option<u64>,
    pub tx_lead_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutboundYaml {
    pub store: Option<SlotStoreBackend>,
    pub database_url: Option<String>,
    pub dispatch_url: Option<String>,
    pub default_capacity: Option<usize>,
    pub capacities: Option<HashMap<String, usize>>,
    pub lease_ttl_ms: Option<u64>,
    pub reap_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DirectoryYaml {
    pub url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub default_business: Option<String>,
    pub businesses: Option<Vec<BusinessConfig>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PersistenceYaml {
    pub webhook_url: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ApologyYaml {
    pub wav_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
}

impl YamlConfig {
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config {}: {}", path.display(), e))?;
        Ok(config)
    }
}
