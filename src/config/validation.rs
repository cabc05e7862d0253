use url::Url;

use super::{ServerConfig, SlotStoreBackend};

/// Endpoints the bridge calls out to must be absolute URLs of the given schemes.
fn check_endpoint(name: &str, value: &str, schemes: &[&str]) -> Result<(), String> {
    let url = Url::parse(value).map_err(|e| format!("{name} is not a valid URL: {e}"))?;
    if !schemes.contains(&url.scheme()) {
        return Err(format!(
            "{name} must use one of {}, got '{}'",
            schemes.join("/"),
            url.scheme()
        ));
    }
    if url.host_str().is_none() {
        return Err(format!("{name} has no host"));
    }
    Ok(())
}

/// Reject settings that cannot work together.
pub(super) fn validate(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.slot_store == SlotStoreBackend::Postgres {
        if config.database_url.is_none() {
            return Err("SLOT_STORE=postgres requires DATABASE_URL".into());
        }
        if !cfg!(feature = "postgres") {
            return Err(
                "SLOT_STORE=postgres requires building with the `postgres` feature".into(),
            );
        }
    }

    if config.outbound.default_capacity == 0 {
        return Err("OUTBOUND_CAPACITY must be at least 1".into());
    }
    if config.outbound.lease_ttl_ms < 3 {
        return Err("SLOT_LEASE_TTL_MS is too small to heartbeat".into());
    }

    if let Some(default) = &config.default_business
        && config.directory_url.is_none()
        && !config.businesses.iter().any(|b| &b.business_id == default)
    {
        return Err(format!("Default business '{default}' is not configured").into());
    }

    if !matches!(config.pipeline.stt_sample_rate, 8000 | 16000 | 24000 | 48000) {
        return Err(format!(
            "Unsupported STT sample rate {}",
            config.pipeline.stt_sample_rate
        )
        .into());
    }

    const HTTP: &[&str] = &["http", "https"];
    const WS: &[&str] = &["ws", "wss"];
    let optional_http = [
        ("DIRECTORY_URL", &config.directory_url),
        ("PERSISTENCE_WEBHOOK_URL", &config.persistence_webhook_url),
        ("OUTBOUND_DISPATCH_URL", &config.dispatch_url),
    ];
    for (name, value) in optional_http {
        if let Some(value) = value {
            check_endpoint(name, value, HTTP)?;
        }
    }
    check_endpoint("REALTIME_URL", &config.realtime.url, WS)?;
    check_endpoint("STT_URL", &config.pipeline.stt_url, WS)?;
    check_endpoint("LLM_URL", &config.pipeline.llm_base_url, HTTP)?;
    check_endpoint("TTS_URL", &config.pipeline.tts_base_url, HTTP)?;

    if config.realtime.session_confirm_timeout_ms == 0 {
        return Err("SESSION_CONFIRM_TIMEOUT_MS must be positive".into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = ServerConfig::default();
        config.outbound.default_capacity = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_default_business_rejected() {
        let mut config = ServerConfig::default();
        config.default_business = Some("ghost".to_string());
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("ghost"));

        config.directory_url = Some("http://directory.local".to_string());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_endpoint_schemes_checked() {
        let mut config = ServerConfig::default();
        config.persistence_webhook_url = Some("ftp://crm.local/outcomes".to_string());
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("PERSISTENCE_WEBHOOK_URL"));

        config.persistence_webhook_url = Some("https://crm.local/outcomes".to_string());
        config.pipeline.stt_url = "https://api.deepgram.com/v1/listen".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("STT_URL"));
    }

    #[test]
    fn test_malformed_directory_url_rejected() {
        let mut config = ServerConfig::default();
        config.directory_url = Some("directory.local/lookup".to_string());
        assert!(validate(&config).is_err());
    }
}
