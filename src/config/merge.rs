use std::path::PathBuf;

use super::env;
use super::yaml::YamlConfig;
use super::{ServerConfig, TlsConfig};

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn set_opt<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}

/// Environment configuration with YAML values applied on top.
pub(super) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = env::from_env()?;
    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(server) = yaml.server {
        set(&mut config.host, server.host);
        set(&mut config.port, server.port);
        set(&mut config.start_timeout_ms, server.start_timeout_ms);
        if let Some(tls) = server.tls {
            config.tls = Some(TlsConfig {
                cert_path: tls.cert_path,
                key_path: tls.key_path,
            });
        }
    }

    if let Some(providers) = yaml.providers {
        set_opt(&mut config.openai_api_key, providers.openai_api_key);
        set_opt(&mut config.deepgram_api_key, providers.deepgram_api_key);
    }

    if let Some(realtime) = yaml.realtime {
        let format = realtime.parsed_audio_format()?;
        let settings = &mut config.realtime;
        set(&mut settings.url, realtime.url);
        set(&mut settings.model, realtime.model);
        set(&mut settings.audio_format, format);
        set(&mut settings.transcription_model, realtime.transcription_model);
        set_opt(&mut settings.vad_threshold, realtime.vad_threshold);
        set_opt(&mut settings.vad_silence_duration_ms, realtime.vad_silence_duration_ms);
        set(
            &mut settings.session_confirm_timeout_ms,
            realtime.session_confirm_timeout_ms,
        );
        set(&mut settings.reconnection.max_attempts, realtime.reconnect_attempts);
    }

    if let Some(pipeline) = yaml.pipeline {
        let settings = &mut config.pipeline;
        set(&mut settings.stt_url, pipeline.stt_url);
        set(&mut settings.stt_model, pipeline.stt_model);
        set(&mut settings.stt_sample_rate, pipeline.stt_sample_rate);
        set(&mut settings.stt_endpointing_ms, pipeline.stt_endpointing_ms);
        set(&mut settings.llm_base_url, pipeline.llm_base_url);
        set(&mut settings.llm_model, pipeline.llm_model);
        set(&mut settings.tts_base_url, pipeline.tts_base_url);
        set(&mut settings.tts_model, pipeline.tts_model);
        set(&mut settings.request_timeout_ms, pipeline.request_timeout_ms);
        set(&mut settings.retry_delay_ms, pipeline.retry_delay_ms);
        set(&mut settings.reconnection.max_attempts, pipeline.reconnect_attempts);
    }

    if let Some(bridge) = yaml.bridge {
        set(&mut config.interrupt_lock_ms, bridge.interrupt_lock_ms);
        set(&mut config.cancel_ack_timeout_ms, bridge.cancel_ack_timeout_ms);
        set(&mut config.tx_lead_ms, bridge.tx_lead_ms);
    }

    set(&mut config.drain, yaml.drain);

    if let Some(outbound) = yaml.outbound {
        set(&mut config.slot_store, outbound.store);
        set_opt(&mut config.database_url, outbound.database_url);
        set_opt(&mut config.dispatch_url, outbound.dispatch_url);
        set(&mut config.outbound.default_capacity, outbound.default_capacity);
        set(&mut config.outbound.capacities, outbound.capacities);
        set(&mut config.outbound.lease_ttl_ms, outbound.lease_ttl_ms);
        set(&mut config.outbound.reap_interval_ms, outbound.reap_interval_ms);
    }

    if let Some(directory) = yaml.directory {
        set_opt(&mut config.directory_url, directory.url);
        set(&mut config.directory_timeout_ms, directory.timeout_ms);
        set_opt(&mut config.default_business, directory.default_business);
        set(&mut config.businesses, directory.businesses);
    }

    if let Some(persistence) = yaml.persistence {
        set_opt(&mut config.persistence_webhook_url, persistence.webhook_url);
        set(&mut config.persistence_timeout_ms, persistence.timeout_ms);
    }

    if let Some(apology) = yaml.apology {
        set_opt::<PathBuf>(&mut config.apology_wav_path, apology.wav_path);
    }

    if let Some(security) = yaml.security {
        set_opt(
            &mut config.max_websocket_connections,
            security.max_websocket_connections,
        );
        set(&mut config.max_connections_per_ip, security.max_connections_per_ip);
    }

    Ok(config)
}
