//! Barge-in controller.
//!
//! Speech-start events only arm the controller. Audio is cut and the active
//! response cancelled once a non-empty transcription confirms the caller
//! actually said something.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::provider::ProviderResult;
use super::session::CallSession;

/// Tier 2 window: queued audio plus a very recent send.
pub const QUEUED_AUDIO_WINDOW: Duration = Duration::from_millis(250);

/// Tier 3 window: any recent send.
pub const RECENT_AUDIO_WINDOW: Duration = Duration::from_millis(400);

/// Whether AI audio is reaching the caller at `now`.
///
/// Tiers, most reliable first:
/// 1. the endpoint is still rendering audio already sent (`now < playout_until`)
/// 2. frames are queued for sending and audio went out within 250ms
/// 3. audio went out within 400ms
pub fn ai_speaking_now(
    now: Instant,
    last_ai_audio: Option<Instant>,
    playout_until: Option<Instant>,
    tx_queue_non_empty: bool,
) -> bool {
    if let Some(until) = playout_until
        && now < until
    {
        return true;
    }

    let Some(last) = last_ai_audio else {
        return false;
    };
    let since_last = now.saturating_duration_since(last);

    if tx_queue_non_empty && since_last < QUEUED_AUDIO_WINDOW {
        return true;
    }
    since_last < RECENT_AUDIO_WINDOW
}

/// Side effects an interruption has on the outside world.
#[async_trait]
pub trait InterruptEffects: Send + Sync {
    /// Ask the provider to stop generating `response_id`.
    async fn cancel_response(&self, response_id: &str) -> ProviderResult<()>;

    /// Tell the telephony endpoint to discard audio it has buffered.
    async fn clear_playback(&self);
}

#[derive(Debug, Clone)]
pub struct BargeInConfig {
    /// Cooldown after an interruption during which speech starts are ignored.
    pub interrupt_lock: Duration,
    /// How long to wait for the provider to acknowledge a cancel.
    pub cancel_ack_timeout: Duration,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            interrupt_lock: Duration::from_millis(1500),
            cancel_ack_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BargeInState {
    Idle,
    PendingConfirmation {
        /// Response active when the caller started speaking.
        response_id: Option<String>,
        utterance_start: Instant,
    },
    Cancelling {
        response_id: String,
        since: Instant,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interruption {
    pub generation: u64,
    pub cancelled_response_id: Option<String>,
    pub flushed_frames: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionOutcome {
    /// Ordinary caller turn, no interruption involved.
    Turn,
    /// Blank transcription after a speech start; the AI keeps talking.
    Rejected,
    /// Caller speech confirmed; AI audio was cut.
    Interrupted(Interruption),
    /// A newer response started after the speech start; nothing was cancelled.
    StaleCancelDropped,
}

#[derive(Debug)]
pub struct BargeInController {
    session: Arc<CallSession>,
    config: BargeInConfig,
    state: BargeInState,
    interrupt_lock_until: Option<Instant>,
    pending_user_text: Option<String>,
}

impl BargeInController {
    pub fn new(session: Arc<CallSession>, config: BargeInConfig) -> Self {
        Self {
            session,
            config,
            state: BargeInState::Idle,
            interrupt_lock_until: None,
            pending_user_text: None,
        }
    }

    pub fn state(&self) -> &BargeInState {
        &self.state
    }

    /// Text confirmed by the last interruption, for the next AI turn.
    pub fn take_pending_user_text(&mut self) -> Option<String> {
        self.pending_user_text.take()
    }

    pub fn pending_user_text(&self) -> Option<&str> {
        self.pending_user_text.as_deref()
    }

    pub fn on_speech_started(&mut self, now: Instant) {
        self.expire_cancel(now);

        if self.state != BargeInState::Idle {
            debug!(call_id = %self.session.call_id(), state = ?self.state, "speech start ignored: barge-in already armed");
            return;
        }
        if let Some(until) = self.interrupt_lock_until
            && now < until
        {
            debug!(call_id = %self.session.call_id(), "speech start ignored: interrupt lock active");
            return;
        }

        let active = self.session.active_response_id();
        let speaking = self.session.is_ai_speaking() || self.session.is_ai_speaking_now(now);
        if !speaking && active.is_none() {
            return;
        }

        debug!(
            call_id = %self.session.call_id(),
            response_id = ?active,
            "caller speech while AI speaking, awaiting transcription"
        );
        self.state = BargeInState::PendingConfirmation {
            response_id: active,
            utterance_start: now,
        };
    }

    pub async fn on_transcription(
        &mut self,
        text: &str,
        now: Instant,
        effects: &dyn InterruptEffects,
    ) -> TranscriptionOutcome {
        self.expire_cancel(now);

        let pending = match &self.state {
            BargeInState::PendingConfirmation { response_id, .. } => response_id.clone(),
            _ => return TranscriptionOutcome::Turn,
        };

        let text = text.trim();
        if text.is_empty() {
            info!(call_id = %self.session.call_id(), "barge-in rejected: empty transcription");
            self.state = BargeInState::Idle;
            return TranscriptionOutcome::Rejected;
        }

        // Any response other than the armed one started after the caller did.
        let current = self.session.active_response_id();
        if let Some(current) = &current
            && pending.as_deref() != Some(current.as_str())
        {
            warn!(
                call_id = %self.session.call_id(),
                armed = ?pending,
                current = %current,
                "dropping stale cancel: a newer response is active"
            );
            self.state = BargeInState::Idle;
            self.pending_user_text = Some(text.to_string());
            return TranscriptionOutcome::StaleCancelDropped;
        }

        let generation = self.session.bump_generation();

        let mut cancelled_response_id = None;
        if let Some(id) = pending.as_deref() {
            self.session.silence_response(id);
            if self.session.try_begin_cancel(id) {
                match effects.cancel_response(id).await {
                    Ok(()) => cancelled_response_id = Some(id.to_string()),
                    Err(e) => {
                        warn!(call_id = %self.session.call_id(), response_id = %id, "cancel failed: {}", e);
                        self.session.abort_cancel(id);
                    }
                }
            }
        }

        let flushed_frames = self.session.provider_queue.flush() + self.session.tx_queue.flush();
        effects.clear_playback().await;
        self.session.clear_playout();
        self.session.set_ai_speaking(false);

        self.pending_user_text = Some(text.to_string());
        self.interrupt_lock_until = Some(now + self.config.interrupt_lock);
        self.state = match &cancelled_response_id {
            Some(id) => BargeInState::Cancelling {
                response_id: id.clone(),
                since: now,
            },
            None => BargeInState::Idle,
        };

        info!(
            call_id = %self.session.call_id(),
            generation,
            cancelled = ?cancelled_response_id,
            flushed_frames,
            "barge-in confirmed"
        );

        TranscriptionOutcome::Interrupted(Interruption {
            generation,
            cancelled_response_id,
            flushed_frames,
            text: text.to_string(),
        })
    }

    /// Forget an armed or cancelling barge-in; its events belonged to a
    /// connection that is gone. The interrupt lock and pending text stay.
    pub fn reset(&mut self) {
        if self.state != BargeInState::Idle {
            debug!(call_id = %self.session.call_id(), state = ?self.state, "barge-in reset");
            self.state = BargeInState::Idle;
        }
    }

    /// Provider acknowledged the end of `response_id` (done or cancelled).
    pub fn on_response_finished(&mut self, response_id: &str) {
        if let BargeInState::Cancelling { response_id: id, .. } = &self.state
            && id == response_id
        {
            debug!(call_id = %self.session.call_id(), response_id, "cancel acknowledged");
            self.state = BargeInState::Idle;
        }
    }

    fn expire_cancel(&mut self, now: Instant) {
        if let BargeInState::Cancelling { response_id, since } = &self.state
            && now.saturating_duration_since(*since) >= self.config.cancel_ack_timeout
        {
            warn!(call_id = %self.session.call_id(), response_id = %response_id, "cancel never acknowledged");
            self.session.abort_cancel(response_id);
            self.state = BargeInState::Idle;
        }
    }
}
