use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::barge_in::InterruptEffects;
use crate::core::codec::FRAME_MS;
use crate::core::hangup::{DrainConfig, HangupAction};
use crate::core::provider::{ProviderClient, ProviderResult};
use crate::core::session::CallSession;
use crate::core::telephony::TelephonyCommand;

/// Barge-in side effects: cancel on the provider, clear on the telephony leg.
pub struct BridgeEffects {
    provider: Arc<dyn ProviderClient>,
    telephony: mpsc::Sender<TelephonyCommand>,
}

impl BridgeEffects {
    pub fn new(provider: Arc<dyn ProviderClient>, telephony: mpsc::Sender<TelephonyCommand>) -> Self {
        Self {
            provider,
            telephony,
        }
    }
}

#[async_trait]
impl InterruptEffects for BridgeEffects {
    async fn cancel_response(&self, response_id: &str) -> ProviderResult<()> {
        self.provider.cancel_response(response_id).await
    }

    async fn clear_playback(&self) {
        if self.telephony.send(TelephonyCommand::Clear).await.is_err() {
            debug!("telephony writer gone before clear");
        }
    }
}

pub struct TelephonyHangup {
    telephony: mpsc::Sender<TelephonyCommand>,
}

impl TelephonyHangup {
    pub fn new(telephony: mpsc::Sender<TelephonyCommand>) -> Self {
        Self { telephony }
    }
}

#[async_trait]
impl HangupAction for TelephonyHangup {
    async fn hang_up(&self) {
        if self.telephony.send(TelephonyCommand::Hangup).await.is_err() {
            debug!("telephony writer gone before hangup");
        }
    }
}

/// Replace any AI audio with the apology clip, let it play, then hang up.
///
/// Relies on the TX loop still running. The wait is bounded by the clip
/// length plus the drain safety margins.
pub(super) async fn play_apology(
    session: &Arc<CallSession>,
    telephony: &mpsc::Sender<TelephonyCommand>,
    frames: &[Bytes],
    drain: &DrainConfig,
) {
    let call_id = session.call_id();
    let generation = session.bump_generation();
    session.provider_queue.flush();
    session.tx_queue.flush();
    let _ = telephony.send(TelephonyCommand::Clear).await;
    session.clear_playout();
    session.set_ai_speaking(false);

    if !frames.is_empty() {
        info!(call_id, generation, frames = frames.len(), "playing apology");
        session.tx_queue.extend(
            frames
                .iter()
                .map(|f| session.make_frame_at(f.clone(), FRAME_MS, generation)),
        );
        let bound = drain.minimum_wait(frames.len());
        if tokio::time::timeout(bound, session.tx_queue.wait_empty())
            .await
            .is_err()
        {
            warn!(call_id, "apology did not finish playing");
        }
        tokio::time::sleep(Duration::from_millis(drain.playback_buffer_ms)).await;
    }

    if session.try_claim_hangup(true) {
        let _ = telephony.send(TelephonyCommand::Hangup).await;
    }
}
