//! Per-call session state shared by one call's RX, TX and provider loops.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::backpressure::BackpressureGovernor;
use super::barge_in::ai_speaking_now;
use super::provider::AiProvider;

/// One fixed-duration chunk of outbound audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub payload: Bytes,
    /// Audio generation the frame was produced under.
    pub generation: u64,
    /// Monotonic per-call sequence number.
    pub sequence: u64,
    pub duration_ms: u32,
}

/// FIFO of audio frames with event-driven emptiness notification.
#[derive(Debug, Default)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    drained: Notify,
    pushed: Notify,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: AudioFrame) {
        self.frames.lock().push_back(frame);
        self.pushed.notify_waiters();
    }

    pub fn extend(&self, frames: impl IntoIterator<Item = AudioFrame>) {
        {
            let mut queue = self.frames.lock();
            queue.extend(frames);
        }
        self.pushed.notify_waiters();
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        let (frame, now_empty) = {
            let mut queue = self.frames.lock();
            let frame = queue.pop_front();
            (frame, queue.is_empty())
        };
        if now_empty {
            self.drained.notify_waiters();
        }
        frame
    }

    /// Drop everything queued. Returns the number of frames discarded.
    pub fn flush(&self) -> usize {
        let discarded = {
            let mut queue = self.frames.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        self.drained.notify_waiters();
        discarded
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn queued_ms(&self) -> u64 {
        self.frames
            .lock()
            .iter()
            .map(|f| f.duration_ms as u64)
            .sum()
    }

    /// Resolve once the queue is empty.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Resolve once the queue holds at least one frame.
    pub async fn wait_non_empty(&self) {
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    #[default]
    None,
    InProgress,
    Done,
    Cancelled,
}

#[derive(Debug, Default)]
struct ResponseTracker {
    active_id: Option<String>,
    status: ResponseStatus,
    /// Response id a cancel has been sent for and not yet acknowledged.
    cancel_in_flight: Option<String>,
    /// Response whose remaining audio must not be played.
    silenced: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct PlayoutClock {
    last_ai_audio: Option<Instant>,
    playout_until: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub offset_ms: u64,
}

/// Identity of a call as resolved at connect time.
#[derive(Debug, Clone)]
pub struct CallIdentity {
    pub call_id: String,
    pub stream_sid: String,
    pub business_id: String,
    pub ai_provider: AiProvider,
    pub voice_id: String,
}

/// Shared state for a single call.
///
/// Owned by the call's bridge task and handed by `Arc` to that call's loops
/// only; nothing here is reachable from other calls.
#[derive(Debug)]
pub struct CallSession {
    pub identity: CallIdentity,
    started_at: Instant,
    audio_generation: AtomicU64,
    next_sequence: AtomicU64,
    response: Mutex<ResponseTracker>,
    ai_speaking: AtomicBool,
    clock: Mutex<PlayoutClock>,
    pending_hangup: AtomicBool,
    audio_done: AtomicBool,
    hangup_triggered: AtomicBool,
    /// Provider audio not yet converted into telephony frames.
    pub provider_queue: FrameQueue,
    /// Telephony frames awaiting transmission to the caller.
    pub tx_queue: FrameQueue,
    pub governor: Arc<BackpressureGovernor>,
    transcript: Mutex<Vec<TranscriptEntry>>,
}

impl CallSession {
    pub fn new(identity: CallIdentity, governor: Arc<BackpressureGovernor>) -> Arc<Self> {
        Arc::new(Self {
            identity,
            started_at: Instant::now(),
            audio_generation: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
            response: Mutex::new(ResponseTracker::default()),
            ai_speaking: AtomicBool::new(false),
            clock: Mutex::new(PlayoutClock::default()),
            pending_hangup: AtomicBool::new(false),
            audio_done: AtomicBool::new(false),
            hangup_triggered: AtomicBool::new(false),
            provider_queue: FrameQueue::new(),
            tx_queue: FrameQueue::new(),
            governor,
            transcript: Mutex::new(Vec::new()),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.identity.call_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    // =========================================================================
    // Audio generation
    // =========================================================================

    pub fn generation(&self) -> u64 {
        self.audio_generation.load(Ordering::Acquire)
    }

    /// Advance the generation; every frame tagged before this call is stale.
    pub fn bump_generation(&self) -> u64 {
        self.audio_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_stale(&self, frame: &AudioFrame) -> bool {
        frame.generation < self.generation()
    }

    /// Tag a payload with the current generation and the next sequence number.
    pub fn make_frame(&self, payload: Bytes, duration_ms: u32) -> AudioFrame {
        self.make_frame_at(payload, duration_ms, self.generation())
    }

    pub fn make_frame_at(&self, payload: Bytes, duration_ms: u32, generation: u64) -> AudioFrame {
        AudioFrame {
            payload,
            generation,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            duration_ms,
        }
    }

    // =========================================================================
    // Response tracking
    // =========================================================================

    pub fn begin_response(&self, response_id: &str) {
        let mut tracker = self.response.lock();
        tracker.active_id = Some(response_id.to_string());
        tracker.status = ResponseStatus::InProgress;
        self.audio_done.store(false, Ordering::Release);
    }

    /// Record a provider acknowledgement that `response_id` finished.
    ///
    /// Returns true when it was the active response.
    pub fn finish_response(&self, response_id: &str, status: ResponseStatus) -> bool {
        let mut tracker = self.response.lock();
        if tracker.cancel_in_flight.as_deref() == Some(response_id) {
            tracker.cancel_in_flight = None;
        }
        if tracker.active_id.as_deref() != Some(response_id) {
            return false;
        }
        tracker.active_id = None;
        tracker.status = status;
        self.ai_speaking.store(false, Ordering::Release);
        if status == ResponseStatus::Done {
            self.audio_done.store(true, Ordering::Release);
        }
        true
    }

    pub fn active_response_id(&self) -> Option<String> {
        self.response.lock().active_id.clone()
    }

    pub fn response_status(&self) -> ResponseStatus {
        self.response.lock().status
    }

    pub fn cancel_in_flight(&self) -> bool {
        self.response.lock().cancel_in_flight.is_some()
    }

    /// Reserve the right to send a cancel for `response_id`.
    ///
    /// Succeeds only while that response is active and in progress and no
    /// other cancel is outstanding.
    pub fn try_begin_cancel(&self, response_id: &str) -> bool {
        let mut tracker = self.response.lock();
        if tracker.active_id.as_deref() == Some(response_id)
            && tracker.status == ResponseStatus::InProgress
            && tracker.cancel_in_flight.is_none()
        {
            tracker.cancel_in_flight = Some(response_id.to_string());
            true
        } else {
            false
        }
    }

    /// Undo a reservation when the cancel could not be delivered.
    pub fn abort_cancel(&self, response_id: &str) {
        let mut tracker = self.response.lock();
        if tracker.cancel_in_flight.as_deref() == Some(response_id) {
            tracker.cancel_in_flight = None;
        }
    }

    /// Drop the response a dead connection was carrying.
    ///
    /// No acknowledgement will arrive for it, so it is treated as cancelled
    /// and the assistant's turn as over. Returns the abandoned id.
    pub fn abandon_response(&self) -> Option<String> {
        let mut tracker = self.response.lock();
        tracker.cancel_in_flight = None;
        tracker.silenced = None;
        let id = tracker.active_id.take()?;
        tracker.status = ResponseStatus::Cancelled;
        self.ai_speaking.store(false, Ordering::Release);
        self.audio_done.store(true, Ordering::Release);
        Some(id)
    }

    pub fn silence_response(&self, response_id: &str) {
        self.response.lock().silenced = Some(response_id.to_string());
    }

    pub fn is_silenced(&self, response_id: &str) -> bool {
        self.response.lock().silenced.as_deref() == Some(response_id)
    }

    // =========================================================================
    // Speaking / playout
    // =========================================================================

    pub fn set_ai_speaking(&self, speaking: bool) {
        self.ai_speaking.store(speaking, Ordering::Release);
    }

    pub fn is_ai_speaking(&self) -> bool {
        self.ai_speaking.load(Ordering::Acquire)
    }

    /// Record that a frame was handed to the telephony leg at `now`.
    ///
    /// Frames play back to back, so the endpoint finishes rendering this one
    /// `duration` after whichever is later: now, or the end of what it
    /// already holds.
    pub fn record_frame_sent(&self, now: Instant, duration: Duration) {
        let mut clock = self.clock.lock();
        let start = match clock.playout_until {
            Some(until) if until > now => until,
            _ => now,
        };
        clock.last_ai_audio = Some(now);
        clock.playout_until = Some(start + duration);
    }

    /// Audio already handed to the endpoint that has not yet played.
    pub fn buffered_playout(&self, now: Instant) -> Duration {
        match self.clock.lock().playout_until {
            Some(until) if until > now => until - now,
            _ => Duration::ZERO,
        }
    }

    /// Forget playout state after the endpoint was told to clear its buffer.
    pub fn clear_playout(&self) {
        let mut clock = self.clock.lock();
        clock.playout_until = None;
    }

    pub fn last_ai_audio(&self) -> Option<Instant> {
        self.clock.lock().last_ai_audio
    }

    pub fn is_ai_speaking_now(&self, now: Instant) -> bool {
        let clock = *self.clock.lock();
        ai_speaking_now(
            now,
            clock.last_ai_audio,
            clock.playout_until,
            !self.tx_queue.is_empty(),
        )
    }

    /// Audio outstanding across both outbound queues.
    pub fn outbound_queued(&self) -> Duration {
        Duration::from_millis(self.provider_queue.queued_ms() + self.tx_queue.queued_ms())
    }

    // =========================================================================
    // Hangup
    // =========================================================================

    pub fn request_hangup(&self) {
        self.pending_hangup.store(true, Ordering::Release);
    }

    pub fn hangup_pending(&self) -> bool {
        self.pending_hangup.load(Ordering::Acquire)
    }

    pub fn audio_done(&self) -> bool {
        self.audio_done.load(Ordering::Acquire)
    }

    pub fn hangup_triggered(&self) -> bool {
        self.hangup_triggered.load(Ordering::Acquire)
    }

    /// Claim the hangup if every gating condition holds.
    ///
    /// `force` skips the drain conditions (used after a drain timeout or a
    /// fatal error) but never the exactly-once guard.
    pub fn try_claim_hangup(&self, force: bool) -> bool {
        if !force {
            let ready = self.hangup_pending()
                && self.audio_done()
                && self.tx_queue.is_empty()
                && self.provider_queue.is_empty();
            if !ready {
                return false;
            }
        }
        self.hangup_triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // =========================================================================
    // Transcript
    // =========================================================================

    pub fn push_transcript(&self, speaker: Speaker, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        let offset_ms = self.elapsed().as_millis() as u64;
        self.transcript.lock().push(TranscriptEntry {
            speaker,
            text,
            offset_ms,
        });
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().clone()
    }

    pub fn ai_responses(&self) -> Vec<String> {
        self.transcript
            .lock()
            .iter()
            .filter(|e| e.speaker == Speaker::Assistant)
            .map(|e| e.text.clone())
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_session() -> Arc<CallSession> {
    CallSession::new(
        CallIdentity {
            call_id: "CA-test".to_string(),
            stream_sid: "MZ-test".to_string(),
            business_id: "biz-1".to_string(),
            ai_provider: AiProvider::Realtime,
            voice_id: "alloy".to_string(),
        },
        BackpressureGovernor::new(),
    )
}
