//! Outbound call concurrency semaphore.
//!
//! Bounds how many outbound calls one business runs at once, across every
//! worker process. State lives in a [`SlotStore`] under two keys per
//! business:
//!
//! - `slots:{businessId}`: the active-slot set
//! - `queue:{businessId}`: FIFO of waiting job ids
//!
//! Every mutation is a single atomic store operation. In particular a
//! release removes the finished job and promotes the next queued job in the
//! same step, so occupancy never dips below capacity while work is queued.
//! Slots are leases: a worker that stops heartbeating loses its slot to the
//! reaper.

mod dispatch;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use dispatch::{DispatchError, LogDispatcher, OutboundDispatcher, WebhookDispatcher};
pub use memory::MemorySlotStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresSlotStore;

pub fn slots_key(business_id: &str) -> String {
    format!("slots:{business_id}")
}

pub fn queue_key(business_id: &str) -> String {
    format!("queue:{business_id}")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotStoreError {
    /// Store unreachable; the caller should retry later.
    #[error("Slot store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid slot request: {0}")]
    InvalidRequest(String),
}

impl SlotStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type SlotResult<T> = Result<T, SlotStoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundSlot {
    pub business_id: String,
    pub job_id: String,
    /// Unix epoch milliseconds.
    pub acquired_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AcquireOutcome {
    Acquired { slot: OutboundSlot },
    /// The job already holds a slot; its lease was renewed.
    AlreadyActive { slot: OutboundSlot },
    /// 1-based position in the business queue.
    Queued { position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseOutcome {
    /// Whether the job held a slot.
    pub released: bool,
    /// Queued job promoted into the freed slot; start it immediately.
    pub promoted: Option<OutboundSlot>,
    /// Occupancy right after the operation, observed atomically with it.
    pub active_after: usize,
    pub queued_after: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub active: Vec<String>,
    pub queued: Vec<String>,
}

/// Capacity lookup per business.
pub type CapacityFn<'a> = &'a (dyn Fn(&str) -> usize + Send + Sync);

#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Take a slot if the business is under `capacity`, else enqueue.
    async fn acquire(
        &self,
        business_id: &str,
        job_id: &str,
        capacity: usize,
        lease: Duration,
    ) -> SlotResult<AcquireOutcome>;

    /// Free `job_id`'s slot and promote the next queued job, atomically.
    /// A job that was only queued is removed from the queue.
    async fn release(
        &self,
        business_id: &str,
        job_id: &str,
        lease: Duration,
    ) -> SlotResult<ReleaseOutcome>;

    /// Extend the lease. Returns false when the job no longer holds a slot.
    async fn heartbeat(&self, business_id: &str, job_id: &str, lease: Duration) -> SlotResult<bool>;

    /// Drop expired leases and refill freed slots from the queues.
    /// Returns the promoted jobs.
    async fn reap_expired(
        &self,
        capacity: CapacityFn<'_>,
        lease: Duration,
    ) -> SlotResult<Vec<OutboundSlot>>;

    async fn snapshot(&self, business_id: &str) -> SlotResult<SlotSnapshot>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub default_capacity: usize,
    /// Per-business overrides of `default_capacity`.
    pub capacities: HashMap<String, usize>,
    pub lease_ttl_ms: u64,
    pub reap_interval_ms: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            default_capacity: 3,
            capacities: HashMap::new(),
            lease_ttl_ms: 30_000,
            reap_interval_ms: 10_000,
        }
    }
}

impl OutboundConfig {
    pub fn capacity_for(&self, business_id: &str) -> usize {
        self.capacities
            .get(business_id)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Heartbeats go out three times per lease.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.lease_ttl_ms / 3).max(1))
    }
}

/// Front door to the slot store. Callers only ever acquire, release and
/// heartbeat; keys are never touched directly.
#[derive(Clone)]
pub struct OutboundSemaphore {
    store: Arc<dyn SlotStore>,
    config: Arc<OutboundConfig>,
}

impl OutboundSemaphore {
    pub fn new(store: Arc<dyn SlotStore>, config: OutboundConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn in_memory(config: OutboundConfig) -> Self {
        Self::new(Arc::new(MemorySlotStore::new()), config)
    }

    pub fn config(&self) -> &OutboundConfig {
        &self.config
    }

    fn validate(business_id: &str, job_id: &str) -> SlotResult<()> {
        if business_id.trim().is_empty() || job_id.trim().is_empty() {
            return Err(SlotStoreError::InvalidRequest(
                "business_id and job_id are required".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn acquire(&self, business_id: &str, job_id: &str) -> SlotResult<AcquireOutcome> {
        Self::validate(business_id, job_id)?;
        let capacity = self.config.capacity_for(business_id);
        if capacity == 0 {
            return Err(SlotStoreError::InvalidRequest(format!(
                "business {business_id} has no outbound capacity"
            )));
        }
        let outcome = self
            .store
            .acquire(business_id, job_id, capacity, self.config.lease())
            .await?;
        tracing::debug!(business_id, job_id, ?outcome, "outbound acquire");
        Ok(outcome)
    }

    pub async fn release(&self, business_id: &str, job_id: &str) -> SlotResult<ReleaseOutcome> {
        Self::validate(business_id, job_id)?;
        let outcome = self
            .store
            .release(business_id, job_id, self.config.lease())
            .await?;
        if let Some(next) = &outcome.promoted {
            tracing::info!(business_id, released = job_id, promoted = %next.job_id, "outbound slot handed over");
        }
        Ok(outcome)
    }

    pub async fn heartbeat(&self, business_id: &str, job_id: &str) -> SlotResult<bool> {
        Self::validate(business_id, job_id)?;
        self.store
            .heartbeat(business_id, job_id, self.config.lease())
            .await
    }

    pub async fn reap_expired(&self) -> SlotResult<Vec<OutboundSlot>> {
        let config = Arc::clone(&self.config);
        let capacity = move |business_id: &str| config.capacity_for(business_id);
        self.store.reap_expired(&capacity, self.config.lease()).await
    }

    pub async fn snapshot(&self, business_id: &str) -> SlotResult<SlotSnapshot> {
        self.store.snapshot(business_id).await
    }

    /// Keep a held slot alive until `cancel` fires or the slot is lost.
    pub fn spawn_heartbeat(
        &self,
        business_id: String,
        job_id: String,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let semaphore = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(semaphore.config.heartbeat_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match semaphore.heartbeat(&business_id, &job_id).await {
                            Ok(true) => {}
                            Ok(false) => {
                                tracing::warn!(business_id, job_id, "outbound slot lease lost");
                                break;
                            }
                            Err(e) => tracing::warn!(business_id, job_id, "heartbeat failed: {}", e),
                        }
                    }
                }
            }
        })
    }

    /// Periodically reclaim abandoned slots and start the promoted jobs.
    pub fn spawn_reaper(
        &self,
        dispatcher: Arc<dyn OutboundDispatcher>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let semaphore = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                semaphore.config.reap_interval_ms.max(1),
            ));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match semaphore.reap_expired().await {
                            Ok(promoted) => {
                                for slot in promoted {
                                    tracing::info!(business_id = %slot.business_id, job_id = %slot.job_id, "promoted after lease expiry");
                                    if let Err(e) = dispatcher.dispatch(slot).await {
                                        tracing::error!("failed to dispatch promoted job: {}", e);
                                    }
                                }
                            }
                            Err(e) => tracing::warn!("slot reaping failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

/// A slot held by one running call.
///
/// Heartbeats while alive and releases exactly once: explicitly through
/// [`SlotHold::release`], or from `Drop` if the owner never got that far.
/// A job promoted by the release is handed to the dispatcher.
pub struct SlotHold {
    semaphore: OutboundSemaphore,
    dispatcher: Arc<dyn OutboundDispatcher>,
    business_id: String,
    job_id: String,
    heartbeat: CancellationToken,
    released: AtomicBool,
}

impl SlotHold {
    pub fn start(
        semaphore: OutboundSemaphore,
        dispatcher: Arc<dyn OutboundDispatcher>,
        business_id: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Self {
        let business_id = business_id.into();
        let job_id = job_id.into();
        let heartbeat = CancellationToken::new();
        semaphore.spawn_heartbeat(business_id.clone(), job_id.clone(), heartbeat.clone());
        Self {
            semaphore,
            dispatcher,
            business_id,
            job_id,
            heartbeat,
            released: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the slot. Later calls return `None` without touching the store.
    pub async fn release(&self) -> Option<SlotResult<ReleaseOutcome>> {
        if self.released.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.heartbeat.cancel();
        Some(
            release_and_dispatch(
                &self.semaphore,
                self.dispatcher.as_ref(),
                &self.business_id,
                &self.job_id,
            )
            .await,
        )
    }
}

impl Drop for SlotHold {
    fn drop(&mut self) {
        self.heartbeat.cancel();
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(business_id = %self.business_id, job_id = %self.job_id, "slot dropped outside runtime; lease will expire");
            return;
        };
        let semaphore = self.semaphore.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let business_id = std::mem::take(&mut self.business_id);
        let job_id = std::mem::take(&mut self.job_id);
        runtime.spawn(async move {
            let _ = release_and_dispatch(&semaphore, dispatcher.as_ref(), &business_id, &job_id).await;
        });
    }
}

async fn release_and_dispatch(
    semaphore: &OutboundSemaphore,
    dispatcher: &dyn OutboundDispatcher,
    business_id: &str,
    job_id: &str,
) -> SlotResult<ReleaseOutcome> {
    let outcome = semaphore.release(business_id, job_id).await;
    match &outcome {
        Ok(released) => {
            if let Some(next) = released.promoted.clone()
                && let Err(e) = dispatcher.dispatch(next).await
            {
                tracing::error!(business_id, "failed to dispatch promoted job: {}", e);
            }
        }
        Err(e) => tracing::error!(business_id, job_id, "slot release failed: {}", e),
    }
    outcome
}

pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
