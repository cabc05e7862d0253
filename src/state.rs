use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ServerConfig, SlotStoreBackend};
use crate::core::bridge::{CallBridge, DefaultProviderFactory, OutboundSlots};
use crate::core::codec::load_wav_frames;
use crate::core::directory::{CallDirectory, HttpCallDirectory, StaticCallDirectory};
use crate::core::outbound::{
    LogDispatcher, MemorySlotStore, OutboundDispatcher, OutboundSemaphore, SlotStore,
    WebhookDispatcher,
};
use crate::core::persistence::{PersistenceSink, TracingSink, WebhookSink};
use crate::errors::{AppError, AppResult};

/// Why a WebSocket upgrade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    GlobalLimitReached,
    PerIpLimitReached,
}

/// Shared state for every request and call handled by this process.
pub struct AppState {
    pub config: ServerConfig,
    pub bridge: Arc<CallBridge>,
    pub semaphore: OutboundSemaphore,
    pub dispatcher: Arc<dyn OutboundDispatcher>,

    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, usize>,
    reaper: CancellationToken,
}

impl AppState {
    /// Build the call bridge and its collaborators from configuration and
    /// start the outbound slot reaper.
    pub async fn new(config: ServerConfig) -> AppResult<Arc<Self>> {
        let directory = build_directory(&config)?;
        let sink = build_sink(&config)?;
        let store = build_slot_store(&config).await?;
        let dispatcher = build_dispatcher(&config)?;

        let semaphore = OutboundSemaphore::new(store, config.outbound.clone());

        let mut bridge = CallBridge::new(
            directory,
            Arc::new(DefaultProviderFactory::new(config.provider_settings())),
            sink,
            config.bridge_options(),
        )
        .with_outbound(OutboundSlots {
            semaphore: semaphore.clone(),
            dispatcher: Arc::clone(&dispatcher),
        });

        if let Some(path) = &config.apology_wav_path {
            let frames = load_wav_frames(path)?;
            info!(path = %path.display(), frames = frames.len(), "loaded apology clip");
            bridge = bridge.with_apology(frames);
        }

        let reaper = CancellationToken::new();
        semaphore.spawn_reaper(Arc::clone(&dispatcher), reaper.clone());

        Ok(Arc::new(Self {
            config,
            bridge: Arc::new(bridge),
            semaphore,
            dispatcher,
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
            reaper,
        }))
    }

    /// Reserve a WebSocket connection for `ip`, enforcing the global and
    /// per-IP limits.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let per_ip_limit = self.config.max_connections_per_ip as usize;

        // Hold the per-IP entry while checking the global count so two
        // upgrades from one address cannot both pass.
        let mut entry = self.ip_connections.entry(ip).or_insert(0);
        if *entry >= per_ip_limit {
            return Err(ConnectionLimitError::PerIpLimitReached);
        }

        if let Some(max) = self.config.max_websocket_connections {
            let reserved = self
                .ws_connections
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    (current < max).then_some(current + 1)
                });
            if reserved.is_err() {
                return Err(ConnectionLimitError::GlobalLimitReached);
            }
        } else {
            self.ws_connections.fetch_add(1, Ordering::AcqRel);
        }

        *entry += 1;
        Ok(())
    }

    pub fn release_connection(&self, ip: IpAddr) {
        let _ = self
            .ws_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
        self.ip_connections.remove_if_mut(&ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::Acquire)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> usize {
        self.ip_connections.get(ip).map(|c| *c).unwrap_or(0)
    }

    /// Stop background work owned by the state.
    pub fn shutdown(&self) {
        self.reaper.cancel();
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.reaper.cancel();
    }
}

fn build_directory(config: &ServerConfig) -> AppResult<Arc<dyn CallDirectory>> {
    match &config.directory_url {
        Some(url) => {
            let directory = HttpCallDirectory::new(
                url.clone(),
                Duration::from_millis(config.directory_timeout_ms),
            )
            .map_err(|e| AppError::Config(e.to_string()))?;
            info!(url = %url, "using HTTP call directory");
            Ok(Arc::new(directory))
        }
        None => Ok(Arc::new(StaticCallDirectory::new(
            config.businesses.clone(),
            config.default_business.clone(),
        ))),
    }
}

fn build_sink(config: &ServerConfig) -> AppResult<Arc<dyn PersistenceSink>> {
    match &config.persistence_webhook_url {
        Some(url) => {
            let sink = WebhookSink::new(
                url.clone(),
                Duration::from_millis(config.persistence_timeout_ms),
            )
            .map_err(|e| AppError::Config(e.to_string()))?;
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(TracingSink)),
    }
}

async fn build_slot_store(config: &ServerConfig) -> AppResult<Arc<dyn SlotStore>> {
    match config.slot_store {
        SlotStoreBackend::Memory => {
            if config.outbound.default_capacity > 0 {
                warn!("outbound slots are process-local; use SLOT_STORE=postgres for multiple workers");
            }
            Ok(Arc::new(MemorySlotStore::new()))
        }
        #[cfg(feature = "postgres")]
        SlotStoreBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                AppError::Config("SLOT_STORE=postgres requires DATABASE_URL".to_string())
            })?;
            let store = crate::core::outbound::PostgresSlotStore::connect(url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        SlotStoreBackend::Postgres => Err(AppError::Config(
            "SLOT_STORE=postgres needs the `postgres` feature".to_string(),
        )),
    }
}

fn build_dispatcher(config: &ServerConfig) -> AppResult<Arc<dyn OutboundDispatcher>> {
    match &config.dispatch_url {
        Some(url) => Ok(Arc::new(WebhookDispatcher::new(
            url.clone(),
            Duration::from_secs(5),
        )?)),
        None => Ok(Arc::new(LogDispatcher)),
    }
}
