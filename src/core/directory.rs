//! Call Directory: maps an incoming call to the business that owns it.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use super::provider::{AiProvider, CallProfile};

/// Custom stream parameter naming the business a call belongs to.
pub const BUSINESS_ID_PARAMETER: &str = "businessId";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("No business configured for call {0}")]
    NotFound(String),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid directory response: {0}")]
    InvalidResponse(String),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Per-business bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessConfig {
    #[serde(alias = "businessId")]
    pub business_id: String,
    #[serde(default, alias = "aiProvider")]
    pub ai_provider: AiProvider,
    #[serde(default = "default_voice", alias = "voiceId")]
    pub voice_id: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
}

fn default_voice() -> String {
    "alloy".to_string()
}

impl BusinessConfig {
    pub fn profile(&self) -> CallProfile {
        CallProfile {
            voice_id: self.voice_id.clone(),
            instructions: self.instructions.clone(),
            greeting: self.greeting.clone(),
        }
    }
}

#[async_trait]
pub trait CallDirectory: Send + Sync {
    /// Resolve `call_id` using the custom parameters the telephony leg
    /// attached to the stream.
    async fn resolve_business_config(
        &self,
        call_id: &str,
        parameters: &HashMap<String, String>,
    ) -> DirectoryResult<BusinessConfig>;
}

/// Directory backed by configuration.
///
/// Calls carrying a `businessId` parameter resolve to that business; the
/// rest fall back to `default_business` when one is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticCallDirectory {
    pub businesses: Vec<BusinessConfig>,
    pub default_business: Option<String>,
}

impl StaticCallDirectory {
    pub fn new(businesses: Vec<BusinessConfig>, default_business: Option<String>) -> Self {
        Self {
            businesses,
            default_business,
        }
    }

    fn find(&self, business_id: &str) -> Option<&BusinessConfig> {
        self.businesses.iter().find(|b| b.business_id == business_id)
    }
}

#[async_trait]
impl CallDirectory for StaticCallDirectory {
    async fn resolve_business_config(
        &self,
        call_id: &str,
        parameters: &HashMap<String, String>,
    ) -> DirectoryResult<BusinessConfig> {
        let business_id = parameters
            .get(BUSINESS_ID_PARAMETER)
            .or(self.default_business.as_ref())
            .ok_or_else(|| DirectoryError::NotFound(call_id.to_string()))?;
        self.find(business_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(call_id.to_string()))
    }
}

/// Directory service reached over HTTP: `GET {base_url}/calls/{call_id}`.
pub struct HttpCallDirectory {
    client: Client,
    base_url: String,
}

impl HttpCallDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> DirectoryResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CallDirectory for HttpCallDirectory {
    async fn resolve_business_config(
        &self,
        call_id: &str,
        parameters: &HashMap<String, String>,
    ) -> DirectoryResult<BusinessConfig> {
        let url = format!("{}/calls/{}", self.base_url, call_id);
        let response = self
            .client
            .get(&url)
            .query(parameters)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(call_id.to_string())),
            status if !status.is_success() => Err(DirectoryError::Unavailable(format!(
                "directory returned HTTP {status}"
            ))),
            _ => response
                .json::<BusinessConfig>()
                .await
                .map_err(|e| DirectoryError::InvalidResponse(e.to_string())),
        }
    }
}
