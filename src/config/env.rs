use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::{ServerConfig, SlotStoreBackend, TlsConfig};
use crate::core::codec::AudioFormat;

/// Every variable this module reads.
pub(crate) const ENV_KEYS: &[&str] = &[
    "HOST",
    "PORT",
    "TLS_CERT_PATH",
    "TLS_KEY_PATH",
    "START_TIMEOUT_MS",
    "OPENAI_API_KEY",
    "DEEPGRAM_API_KEY",
    "REALTIME_URL",
    "REALTIME_MODEL",
    "REALTIME_AUDIO_FORMAT",
    "SESSION_CONFIRM_TIMEOUT_MS",
    "STT_URL",
    "STT_MODEL",
    "LLM_URL",
    "LLM_MODEL",
    "TTS_URL",
    "TTS_MODEL",
    "INTERRUPT_LOCK_MS",
    "CANCEL_ACK_TIMEOUT_MS",
    "TX_LEAD_MS",
    "OUTBOUND_CAPACITY",
    "SLOT_LEASE_TTL_MS",
    "SLOT_STORE",
    "DATABASE_URL",
    "OUTBOUND_DISPATCH_URL",
    "DIRECTORY_URL",
    "DIRECTORY_TIMEOUT_MS",
    "DEFAULT_BUSINESS_ID",
    "PERSISTENCE_WEBHOOK_URL",
    "PERSISTENCE_TIMEOUT_MS",
    "APOLOGY_WAV_PATH",
    "MAX_WEBSOCKET_CONNECTIONS",
    "MAX_CONNECTIONS_PER_IP",
];

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(key: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {key}: {e}").into()),
        None => Ok(None),
    }
}

/// Build the configuration from environment variables over defaults.
pub(super) fn from_env() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = ServerConfig::default();

    if let Some(host) = var("HOST") {
        config.host = host;
    }
    if let Some(port) = parse_var("PORT")? {
        config.port = port;
    }
    config.tls = match (var("TLS_CERT_PATH"), var("TLS_KEY_PATH")) {
        (Some(cert), Some(key)) => Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        }),
        (None, None) => None,
        _ => return Err("TLS_CERT_PATH and TLS_KEY_PATH must be set together".into()),
    };
    if let Some(ms) = parse_var("START_TIMEOUT_MS")? {
        config.start_timeout_ms = ms;
    }

    config.openai_api_key = var("OPENAI_API_KEY");
    config.deepgram_api_key = var("DEEPGRAM_API_KEY");

    if let Some(url) = var("REALTIME_URL") {
        config.realtime.url = url;
    }
    if let Some(model) = var("REALTIME_MODEL") {
        config.realtime.model = model;
    }
    if let Some(format) = parse_var::<AudioFormat>("REALTIME_AUDIO_FORMAT")? {
        config.realtime.audio_format = format;
    }
    if let Some(ms) = parse_var("SESSION_CONFIRM_TIMEOUT_MS")? {
        config.realtime.session_confirm_timeout_ms = ms;
    }

    if let Some(url) = var("STT_URL") {
        config.pipeline.stt_url = url;
    }
    if let Some(model) = var("STT_MODEL") {
        config.pipeline.stt_model = model;
    }
    if let Some(url) = var("LLM_URL") {
        config.pipeline.llm_base_url = url;
    }
    if let Some(model) = var("LLM_MODEL") {
        config.pipeline.llm_model = model;
    }
    if let Some(url) = var("TTS_URL") {
        config.pipeline.tts_base_url = url;
    }
    if let Some(model) = var("TTS_MODEL") {
        config.pipeline.tts_model = model;
    }

    if let Some(ms) = parse_var("INTERRUPT_LOCK_MS")? {
        config.interrupt_lock_ms = ms;
    }
    if let Some(ms) = parse_var("CANCEL_ACK_TIMEOUT_MS")? {
        config.cancel_ack_timeout_ms = ms;
    }
    if let Some(ms) = parse_var("TX_LEAD_MS")? {
        config.tx_lead_ms = ms;
    }

    if let Some(capacity) = parse_var("OUTBOUND_CAPACITY")? {
        config.outbound.default_capacity = capacity;
    }
    if let Some(ms) = parse_var("SLOT_LEASE_TTL_MS")? {
        config.outbound.lease_ttl_ms = ms;
    }
    if let Some(store) = parse_var::<SlotStoreBackend>("SLOT_STORE")? {
        config.slot_store = store;
    }
    config.database_url = var("DATABASE_URL");
    config.dispatch_url = var("OUTBOUND_DISPATCH_URL");

    config.directory_url = var("DIRECTORY_URL");
    if let Some(ms) = parse_var("DIRECTORY_TIMEOUT_MS")? {
        config.directory_timeout_ms = ms;
    }
    config.default_business = var("DEFAULT_BUSINESS_ID");

    config.persistence_webhook_url = var("PERSISTENCE_WEBHOOK_URL");
    if let Some(ms) = parse_var("PERSISTENCE_TIMEOUT_MS")? {
        config.persistence_timeout_ms = ms;
    }

    config.apology_wav_path = var("APOLOGY_WAV_PATH").map(PathBuf::from);

    config.max_websocket_connections = parse_var("MAX_WEBSOCKET_CONNECTIONS")?;
    if let Some(limit) = parse_var("MAX_CONNECTIONS_PER_IP")? {
        config.max_connections_per_ip = limit;
    }

    Ok(config)
}
