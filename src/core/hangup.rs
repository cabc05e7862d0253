//! Hangup/drain sequencer.
//!
//! Once the AI has asked to end the call and its final response is done,
//! the sequencer lets queued audio play out before the telephony leg is
//! torn down. A queue that never drains is bounded; the call is hung up
//! regardless.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::codec::FRAME_MS;
use super::session::CallSession;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub frame_ms: u64,
    pub safety_buffer_ms: u64,
    pub provider_queue_bound_ms: u64,
    pub tx_queue_bound_ms: u64,
    pub playback_buffer_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            frame_ms: FRAME_MS as u64,
            safety_buffer_ms: 400,
            provider_queue_bound_ms: 30_000,
            tx_queue_bound_ms: 60_000,
            playback_buffer_ms: 500,
        }
    }
}

impl DrainConfig {
    /// Lower bound on the drain for `frames` queued frames.
    pub fn minimum_wait(&self, frames: usize) -> Duration {
        self.minimum_wait_for(Duration::from_millis(frames as u64 * self.frame_ms))
    }

    /// Lower bound on the drain for `queued` audio, however it is chunked.
    pub fn minimum_wait_for(&self, queued: Duration) -> Duration {
        queued + Duration::from_millis(self.safety_buffer_ms)
    }
}

/// Terminates the telephony leg.
#[async_trait]
pub trait HangupAction: Send + Sync {
    async fn hang_up(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HangupOutcome {
    /// Queues drained and the call was hung up.
    Completed { waited: Duration },
    /// A queue missed its bound; the call was hung up anyway.
    DrainTimeout {
        waited: Duration,
        provider_drained: bool,
        tx_drained: bool,
    },
    /// Gating conditions no longer hold (e.g. a new response started).
    NotReady,
    /// Another trigger already hung up.
    AlreadyTriggered,
}

pub struct HangupSequencer {
    session: Arc<CallSession>,
    config: DrainConfig,
}

impl HangupSequencer {
    pub fn new(session: Arc<CallSession>, config: DrainConfig) -> Self {
        Self { session, config }
    }

    pub async fn run(&self, action: &dyn HangupAction) -> HangupOutcome {
        let call_id = self.session.call_id();
        if self.session.hangup_triggered() {
            return HangupOutcome::AlreadyTriggered;
        }

        // Provider chunks can hold many frames, so the bound follows queued audio.
        let provider_frames = self.session.provider_queue.len();
        let tx_frames = self.session.tx_queue.len();
        let queued = self.session.outbound_queued();
        let minimum = self.config.minimum_wait_for(queued);
        let start = Instant::now();
        info!(
            call_id,
            provider_frames,
            tx_frames,
            queued_ms = queued.as_millis() as u64,
            minimum_ms = minimum.as_millis() as u64,
            "draining before hangup"
        );

        let provider_drained = tokio::time::timeout_at(
            start + Duration::from_millis(self.config.provider_queue_bound_ms),
            self.session.provider_queue.wait_empty(),
        )
        .await
        .is_ok();

        let tx_drained = tokio::time::timeout_at(
            start + Duration::from_millis(self.config.tx_queue_bound_ms),
            self.session.tx_queue.wait_empty(),
        )
        .await
        .is_ok();

        tokio::time::sleep_until(start + minimum).await;
        tokio::time::sleep(Duration::from_millis(self.config.playback_buffer_ms)).await;

        let timed_out = !(provider_drained && tx_drained);
        if timed_out {
            warn!(call_id, provider_drained, tx_drained, "drain timeout, hanging up anyway");
        }

        if !self.session.try_claim_hangup(timed_out) {
            return if self.session.hangup_triggered() {
                HangupOutcome::AlreadyTriggered
            } else {
                info!(call_id, "hangup deferred: call is active again");
                HangupOutcome::NotReady
            };
        }

        action.hang_up().await;
        let waited = start.elapsed();
        info!(call_id, waited_ms = waited.as_millis() as u64, "call hung up");

        if timed_out {
            HangupOutcome::DrainTimeout {
                waited,
                provider_drained,
                tx_drained,
            }
        } else {
            HangupOutcome::Completed { waited }
        }
    }
}
