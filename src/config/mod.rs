//! Configuration for the call bridge server
//!
//! Configuration comes from `.env` files, environment variables and an optional YAML
//! file. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Applying YAML overrides on top of the environment
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use waav_call_bridge::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_env()?;
//!
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod env;
mod merge;
mod validation;
mod yaml;

use crate::core::barge_in::BargeInConfig;
use crate::core::bridge::BridgeOptions;
use crate::core::directory::BusinessConfig;
use crate::core::hangup::DrainConfig;
use crate::core::outbound::OutboundConfig;
use crate::core::provider::ProviderSettings;
use crate::core::provider::pipeline::PipelineSettings;
use crate::core::provider::realtime::RealtimeSettings;

pub use yaml::YamlConfig;

/// TLS configuration for HTTPS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Where outbound slots live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStoreBackend {
    #[default]
    Memory,
    Postgres,
}

impl std::str::FromStr for SlotStoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!(
                "Unsupported slot store: {other}. Supported stores: memory, postgres"
            )),
        }
    }
}

/// Server configuration
///
/// Groups:
/// - Server binding and TLS
/// - Provider credentials and backend settings
/// - Call behavior (barge-in, drain, TX pacing)
/// - Outbound semaphore
/// - Call directory and persistence sink
/// - Connection limits
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// Bound on the telephony `start` message after the socket opens.
    pub start_timeout_ms: u64,

    // Provider credentials
    pub openai_api_key: Option<String>,
    pub deepgram_api_key: Option<String>,

    // Provider backends
    pub realtime: RealtimeSettings,
    pub pipeline: PipelineSettings,

    // Call behavior
    pub interrupt_lock_ms: u64,
    pub cancel_ack_timeout_ms: u64,
    pub tx_lead_ms: u64,
    pub drain: DrainConfig,

    // Outbound semaphore
    pub outbound: OutboundConfig,
    pub slot_store: SlotStoreBackend,
    pub database_url: Option<String>,
    /// Dialer endpoint receiving promoted jobs; logged only when unset.
    pub dispatch_url: Option<String>,

    // Call directory
    pub directory_url: Option<String>,
    pub directory_timeout_ms: u64,
    pub default_business: Option<String>,
    pub businesses: Vec<BusinessConfig>,

    // Persistence sink
    pub persistence_webhook_url: Option<String>,
    pub persistence_timeout_ms: u64,

    /// WAV clip played before disconnecting on a fatal provider failure.
    pub apology_wav_path: Option<PathBuf>,

    // Connection limits
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            start_timeout_ms: 10_000,
            openai_api_key: None,
            deepgram_api_key: None,
            realtime: RealtimeSettings::default(),
            pipeline: PipelineSettings::default(),
            interrupt_lock_ms: 1500,
            cancel_ack_timeout_ms: 5000,
            tx_lead_ms: 100,
            drain: DrainConfig::default(),
            outbound: OutboundConfig::default(),
            slot_store: SlotStoreBackend::Memory,
            database_url: None,
            dispatch_url: None,
            directory_url: None,
            directory_timeout_ms: 2000,
            default_business: None,
            businesses: Vec::new(),
            persistence_webhook_url: None,
            persistence_timeout_ms: 3000,
            apology_wav_path: None,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
        }
    }
}

/// Zeroize every secret when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.openai_api_key {
            key.zeroize();
        }
        if let Some(ref mut key) = self.deepgram_api_key {
            key.zeroize();
        }
        if let Some(ref mut url) = self.database_url {
            url.zeroize();
        }
        self.realtime.api_key.zeroize();
        self.pipeline.stt_api_key.zeroize();
        self.pipeline.llm_api_key.zeroize();
        self.pipeline.tts_api_key.zeroize();
    }
}

impl ServerConfig {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = env::from_env()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file on top of the environment.
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// The merged configuration is validated before it is returned.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        // .env is loaded in main.rs before this runs.
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Backend settings with credentials filled in.
    pub fn provider_settings(&self) -> ProviderSettings {
        let openai_key = self.openai_api_key.clone().unwrap_or_default();

        let mut realtime = self.realtime.clone();
        if realtime.api_key.is_empty() {
            realtime.api_key = openai_key.clone();
        }

        let mut pipeline = self.pipeline.clone();
        if pipeline.stt_api_key.is_empty() {
            pipeline.stt_api_key = self.deepgram_api_key.clone().unwrap_or_default();
        }
        if pipeline.llm_api_key.is_empty() {
            pipeline.llm_api_key = openai_key.clone();
        }
        if pipeline.tts_api_key.is_empty() {
            pipeline.tts_api_key = openai_key;
        }

        ProviderSettings { realtime, pipeline }
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            barge_in: BargeInConfig {
                interrupt_lock: Duration::from_millis(self.interrupt_lock_ms),
                cancel_ack_timeout: Duration::from_millis(self.cancel_ack_timeout_ms),
            },
            drain: self.drain.clone(),
            tx_lead: Duration::from_millis(self.tx_lead_ms),
            ready_timeout: self.realtime.session_confirm_timeout(),
            sink_timeout: Duration::from_millis(self.persistence_timeout_ms),
            ..BridgeOptions::default()
        }
    }
}
