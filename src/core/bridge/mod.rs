//! Per-call media bridge.
//!
//! Wires one telephony stream to one AI provider. The transport stays
//! outside: the caller feeds [`TelephonyEvent`]s in and drains
//! [`TelephonyCommand`]s out, which is what the WebSocket handler does and
//! what the tests do with plain channels.
//!
//! Three tasks share the [`CallSession`]:
//!
//! - RX: caller audio to the provider, subject to backpressure
//! - TX: provider audio to the caller, paced in 20ms frames
//! - provider receive (this task): barge-in, response tracking, tools, hangup

mod effects;
mod loops;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backpressure::BackpressureGovernor;
use super::barge_in::{BargeInConfig, BargeInController, TranscriptionOutcome};
use super::codec::AudioFormat;
use super::directory::{BUSINESS_ID_PARAMETER, BusinessConfig, CallDirectory, DirectoryError};
use super::hangup::{DrainConfig, HangupOutcome, HangupSequencer};
use super::outbound::{OutboundDispatcher, OutboundSemaphore, SlotHold};
use super::persistence::{CallOutcome, EndReason, PersistenceSink, record_detached};
use super::provider::{
    AiProvider, CallProfile, END_CALL_TOOL, FunctionCall, ProviderClient, ProviderError,
    ProviderEvent, ProviderResult, ProviderSettings, create_provider,
};
use super::session::{CallIdentity, CallSession, ResponseStatus, Speaker};
use super::telephony::{TelephonyCommand, TelephonyEvent};

pub use effects::{BridgeEffects, TelephonyHangup};

/// Custom stream parameter carrying the outbound job that owns a slot.
pub const JOB_ID_PARAMETER: &str = "jobId";

/// Reply for tools this bridge does not implement.
pub const TOOL_NOT_SUPPORTED: &str = r#"{"error":"not supported"}"#;

const END_CALL_ACK: &str = r#"{"status":"ending call"}"#;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Provider event stream already taken")]
    EventsUnavailable,
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Builds the provider client for a call.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        kind: AiProvider,
        profile: &CallProfile,
        governor: Arc<BackpressureGovernor>,
    ) -> ProviderResult<Arc<dyn ProviderClient>>;
}

/// Factory for the real backends.
pub struct DefaultProviderFactory {
    settings: ProviderSettings,
}

impl DefaultProviderFactory {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn create(
        &self,
        kind: AiProvider,
        profile: &CallProfile,
        governor: Arc<BackpressureGovernor>,
    ) -> ProviderResult<Arc<dyn ProviderClient>> {
        create_provider(kind, &self.settings, profile, governor)
    }
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub barge_in: BargeInConfig,
    pub drain: DrainConfig,
    /// Audio kept buffered at the telephony endpoint ahead of playback.
    pub tx_lead: Duration,
    /// Bound on provider session readiness.
    pub ready_timeout: Duration,
    /// Pause before the single reconnect attempt on a transient connect error.
    pub connect_retry_delay: Duration,
    pub sink_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            barge_in: BargeInConfig::default(),
            drain: DrainConfig::default(),
            tx_lead: Duration::from_millis(100),
            ready_timeout: Duration::from_secs(5),
            connect_retry_delay: Duration::from_millis(250),
            sink_timeout: Duration::from_secs(3),
        }
    }
}

/// Identity of a stream once the telephony leg has sent `start`.
#[derive(Debug, Clone, Default)]
pub struct CallStart {
    pub call_id: String,
    pub stream_sid: String,
    pub parameters: HashMap<String, String>,
}

/// Outbound slot bookkeeping for calls placed by a worker.
#[derive(Clone)]
pub struct OutboundSlots {
    pub semaphore: OutboundSemaphore,
    pub dispatcher: Arc<dyn OutboundDispatcher>,
}

/// First-wins end reason plus the token that stops the call's tasks.
#[derive(Debug, Default)]
pub(crate) struct CallEnd {
    reason: Mutex<Option<EndReason>>,
    token: CancellationToken,
}

impl CallEnd {
    pub(crate) fn finish(&self, reason: EndReason) {
        {
            let mut current = self.reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn reason(&self) -> EndReason {
        self.reason
            .lock()
            .clone()
            .unwrap_or(EndReason::CallerHungUp)
    }
}

/// Everything a call needs besides its transport.
pub struct CallBridge {
    directory: Arc<dyn CallDirectory>,
    providers: Arc<dyn ProviderFactory>,
    sink: Arc<dyn PersistenceSink>,
    outbound: Option<OutboundSlots>,
    apology: Arc<Vec<Bytes>>,
    options: BridgeOptions,
}

impl CallBridge {
    pub fn new(
        directory: Arc<dyn CallDirectory>,
        providers: Arc<dyn ProviderFactory>,
        sink: Arc<dyn PersistenceSink>,
        options: BridgeOptions,
    ) -> Self {
        Self {
            directory,
            providers,
            sink,
            outbound: None,
            apology: Arc::new(Vec::new()),
            options,
        }
    }

    pub fn with_outbound(mut self, outbound: OutboundSlots) -> Self {
        self.outbound = Some(outbound);
        self
    }

    /// Frames played to the caller before a fatal disconnect.
    pub fn with_apology(mut self, frames: Vec<Bytes>) -> Self {
        self.apology = Arc::new(frames);
        self
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    fn hold_slot(&self, start: &CallStart) -> Option<SlotHold> {
        let outbound = self.outbound.as_ref()?;
        let job_id = start.parameters.get(JOB_ID_PARAMETER)?;
        let Some(business_id) = start.parameters.get(BUSINESS_ID_PARAMETER) else {
            warn!(call_id = %start.call_id, job_id = %job_id, "outbound job without businessId; slot left to its lease");
            return None;
        };
        Some(SlotHold::start(
            outbound.semaphore.clone(),
            Arc::clone(&outbound.dispatcher),
            business_id.clone(),
            job_id.clone(),
        ))
    }

    /// Run one call to completion and return what was persisted.
    pub async fn run(
        &self,
        start: CallStart,
        inbound: mpsc::Receiver<TelephonyEvent>,
        telephony: mpsc::Sender<TelephonyCommand>,
    ) -> CallOutcome {
        let started = Instant::now();
        let slot = self.hold_slot(&start);
        info!(call_id = %start.call_id, stream_sid = %start.stream_sid, outbound = slot.is_some(), "call started");

        let business = match self
            .directory
            .resolve_business_config(&start.call_id, &start.parameters)
            .await
        {
            Ok(business) => business,
            Err(e) => {
                error!(call_id = %start.call_id, "failed to resolve business: {}", e);
                let _ = telephony.send(TelephonyCommand::Hangup).await;
                let outcome = CallOutcome {
                    call_id: start.call_id.clone(),
                    business_id: start.parameters.get(BUSINESS_ID_PARAMETER).cloned(),
                    transcript: Vec::new(),
                    ai_responses: Vec::new(),
                    end_reason: EndReason::DirectoryFailed,
                    duration_ms: started.elapsed().as_millis() as u64,
                    dropped_frames: 0,
                };
                return self.finish(outcome, slot).await;
            }
        };

        let governor = BackpressureGovernor::new();
        let session = CallSession::new(
            CallIdentity {
                call_id: start.call_id.clone(),
                stream_sid: start.stream_sid.clone(),
                business_id: business.business_id.clone(),
                ai_provider: business.ai_provider,
                voice_id: business.voice_id.clone(),
            },
            Arc::clone(&governor),
        );
        let end = Arc::new(CallEnd::default());

        let provider = self
            .providers
            .create(business.ai_provider, &business.profile(), governor);
        let output_format = provider
            .as_ref()
            .map(|p| p.output_format())
            .unwrap_or(AudioFormat::G711Ulaw);

        let tx_task = tokio::spawn(loops::tx_loop(
            Arc::clone(&session),
            output_format,
            telephony.clone(),
            end.token().clone(),
            self.options.tx_lead,
        ));

        let mut rx_task = None;
        match provider {
            Ok(provider) => {
                match self.establish(&provider, &session).await {
                    Ok(events) => {
                        rx_task = Some(tokio::spawn(loops::rx_loop(
                            Arc::clone(&session),
                            Arc::clone(&provider),
                            inbound,
                            Arc::clone(&end),
                        )));
                        self.greet(&provider, &business, &session).await;
                        self.receive(&provider, events, &session, &end, &telephony)
                            .await;
                    }
                    Err(e) => {
                        error!(call_id = %session.call_id(), "provider unavailable: {}", e);
                        self.apologize_and_hang_up(&session, &telephony).await;
                        end.finish(EndReason::ProviderUnavailable);
                    }
                }
                if let Err(e) = provider.disconnect().await {
                    debug!(call_id = %session.call_id(), "provider disconnect: {}", e);
                }
            }
            Err(e) => {
                error!(call_id = %session.call_id(), "failed to create provider: {}", e);
                self.apologize_and_hang_up(&session, &telephony).await;
                end.finish(EndReason::ProviderUnavailable);
            }
        }

        end.token().cancel();
        if let Some(rx_task) = rx_task {
            let _ = rx_task.await;
        }
        let _ = tx_task.await;

        let reason = end.reason();
        if reason != EndReason::CallerHungUp && session.try_claim_hangup(true) {
            let _ = telephony.send(TelephonyCommand::Hangup).await;
        }

        let outcome = CallOutcome {
            call_id: session.call_id().to_string(),
            business_id: Some(business.business_id.clone()),
            transcript: session.transcript(),
            ai_responses: session.ai_responses(),
            end_reason: reason,
            duration_ms: started.elapsed().as_millis() as u64,
            dropped_frames: session.governor.dropped_frames(),
        };
        self.finish(outcome, slot).await
    }

    async fn finish(&self, outcome: CallOutcome, slot: Option<SlotHold>) -> CallOutcome {
        if let Some(slot) = slot {
            let _ = slot.release().await;
        }
        info!(
            call_id = %outcome.call_id,
            end_reason = outcome.end_reason.as_str(),
            duration_ms = outcome.duration_ms,
            "call ended"
        );
        record_detached(Arc::clone(&self.sink), outcome.clone(), self.options.sink_timeout);
        outcome
    }

    /// Connect, retrying once on a transient failure, and wait for the
    /// session to be usable.
    async fn establish(
        &self,
        provider: &Arc<dyn ProviderClient>,
        session: &CallSession,
    ) -> BridgeResult<mpsc::Receiver<ProviderEvent>> {
        if let Err(e) = provider.connect().await {
            if !e.is_transient() {
                return Err(e.into());
            }
            warn!(call_id = %session.call_id(), "provider connect failed, retrying once: {}", e);
            tokio::time::sleep(self.options.connect_retry_delay).await;
            provider.connect().await?;
        }
        let events = provider
            .take_events()
            .ok_or(BridgeError::EventsUnavailable)?;
        provider.wait_ready(self.options.ready_timeout).await?;
        info!(call_id = %session.call_id(), provider = %session.identity.ai_provider, "provider ready");
        Ok(events)
    }

    async fn greet(
        &self,
        provider: &Arc<dyn ProviderClient>,
        business: &BusinessConfig,
        session: &CallSession,
    ) {
        if business.greeting.is_none() {
            return;
        }
        if let Err(e) = provider.create_response(None).await {
            warn!(call_id = %session.call_id(), "failed to start greeting: {}", e);
        }
    }

    /// Provider-receive loop. Returns once the call is over.
    async fn receive(
        &self,
        provider: &Arc<dyn ProviderClient>,
        mut events: mpsc::Receiver<ProviderEvent>,
        session: &Arc<CallSession>,
        end: &Arc<CallEnd>,
        telephony: &mpsc::Sender<TelephonyCommand>,
    ) {
        let call_id = session.call_id();
        let effects = BridgeEffects::new(Arc::clone(provider), telephony.clone());
        let mut barge_in = BargeInController::new(Arc::clone(session), self.options.barge_in.clone());
        let sequencer_running = Arc::new(AtomicBool::new(false));
        let output_format = provider.output_format();
        // Response to follow up once it completes, after an unsupported tool.
        let mut resume_after: Option<String> = None;

        loop {
            let event = tokio::select! {
                _ = end.token().cancelled() => return,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                warn!(call_id, "provider event stream ended");
                self.apologize_and_hang_up(session, telephony).await;
                end.finish(EndReason::ProviderUnavailable);
                return;
            };

            match event {
                ProviderEvent::SpeechStarted => barge_in.on_speech_started(Instant::now()),
                ProviderEvent::SpeechStopped => {}
                ProviderEvent::TranscriptionCompleted { text } => {
                    session.push_transcript(Speaker::Caller, &text);
                    let outcome = barge_in
                        .on_transcription(&text, Instant::now(), &effects)
                        .await;
                    debug!(call_id, ?outcome, "caller transcription");

                    let user_text = barge_in.take_pending_user_text();
                    let rejected = outcome == TranscriptionOutcome::Rejected;
                    if !provider.responds_automatically() && !rejected {
                        let text = user_text.unwrap_or(text);
                        if !text.trim().is_empty()
                            && let Err(e) = provider.create_response(Some(text)).await
                        {
                            warn!(call_id, "failed to start response: {}", e);
                        }
                    }
                }
                ProviderEvent::ResponseCreated { response_id } => {
                    debug!(call_id, response_id = %response_id, "response created");
                    session.begin_response(&response_id);
                }
                ProviderEvent::AudioDelta { response_id, audio } => {
                    let current = session.active_response_id();
                    if session.is_silenced(&response_id) || current.as_deref() != Some(&response_id) {
                        debug!(call_id, response_id = %response_id, "dropping audio for inactive response");
                        continue;
                    }
                    session.set_ai_speaking(true);
                    let duration_ms = output_format.duration_ms(audio.len()) as u32;
                    session.provider_queue.push(session.make_frame(audio, duration_ms));
                }
                ProviderEvent::AssistantTranscript { text, .. } => {
                    session.push_transcript(Speaker::Assistant, text);
                }
                ProviderEvent::ResponseDone { response_id } => {
                    session.finish_response(&response_id, ResponseStatus::Done);
                    barge_in.on_response_finished(&response_id);
                    if resume_after.as_deref() == Some(response_id.as_str()) {
                        resume_after = None;
                        self.resume_after_tool(provider, session).await;
                    }
                    self.maybe_hang_up(session, telephony, end, &sequencer_running);
                }
                ProviderEvent::ResponseCancelled { response_id } => {
                    session.finish_response(&response_id, ResponseStatus::Cancelled);
                    barge_in.on_response_finished(&response_id);
                    if resume_after.as_deref() == Some(response_id.as_str()) {
                        // the caller's own turn carries the tool reply forward
                        debug!(call_id, response_id = %response_id, "tool follow-up dropped: response cancelled");
                        resume_after = None;
                    }
                }
                ProviderEvent::FunctionCall(call) => {
                    if self.handle_tool(provider, session, call).await {
                        // Starting a response now would supersede the one still running.
                        match session.active_response_id() {
                            Some(active) => resume_after = Some(active),
                            None => self.resume_after_tool(provider, session).await,
                        }
                    }
                    self.maybe_hang_up(session, telephony, end, &sequencer_running);
                }
                ProviderEvent::Error { message } => {
                    warn!(call_id, "provider error: {}", message);
                }
                ProviderEvent::Reconnected {
                    attempt,
                    responses_lost,
                } => {
                    barge_in.reset();
                    if responses_lost {
                        resume_after = None;
                        let abandoned = session.abandon_response();
                        let generation = session.bump_generation();
                        let flushed =
                            session.provider_queue.flush() + session.tx_queue.flush();
                        info!(call_id, attempt, ?abandoned, generation, flushed, "provider reconnected, in-flight response dropped");
                        self.maybe_hang_up(session, telephony, end, &sequencer_running);
                    } else {
                        info!(call_id, attempt, "provider reconnected");
                    }
                }
                ProviderEvent::Closed { reason } => {
                    error!(call_id, reason = %reason, "provider closed");
                    self.apologize_and_hang_up(session, telephony).await;
                    end.finish(EndReason::ProviderUnavailable);
                    return;
                }
            }
        }
    }

    /// Answer a tool call. Returns true when the assistant needs a
    /// follow-up response to react to the answer.
    async fn handle_tool(
        &self,
        provider: &Arc<dyn ProviderClient>,
        session: &CallSession,
        call: FunctionCall,
    ) -> bool {
        let call_id = session.call_id();
        if call.name == END_CALL_TOOL {
            info!(call_id, arguments = %call.arguments, "assistant ended the conversation");
            session.request_hangup();
            if let Err(e) = provider.submit_function_result(&call.call_id, END_CALL_ACK).await {
                warn!(call_id, "failed to acknowledge end_call: {}", e);
            }
            return false;
        }

        warn!(call_id, tool = %call.name, "unsupported tool requested");
        match provider
            .submit_function_result(&call.call_id, TOOL_NOT_SUPPORTED)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(call_id, "failed to answer tool call: {}", e);
                false
            }
        }
    }

    async fn resume_after_tool(&self, provider: &Arc<dyn ProviderClient>, session: &CallSession) {
        if let Err(e) = provider.create_response(None).await {
            warn!(call_id = %session.call_id(), "failed to resume after tool call: {}", e);
        }
    }

    /// Start the drain sequencer once the assistant asked to hang up and
    /// its response is done. A sequencer that finds the call active again
    /// steps aside and a later response re-arms it.
    fn maybe_hang_up(
        &self,
        session: &Arc<CallSession>,
        telephony: &mpsc::Sender<TelephonyCommand>,
        end: &Arc<CallEnd>,
        running: &Arc<AtomicBool>,
    ) {
        if !session.hangup_pending()
            || !session.audio_done()
            || session.active_response_id().is_some()
            || session.hangup_triggered()
        {
            return;
        }
        if running.swap(true, Ordering::AcqRel) {
            return;
        }

        let sequencer = HangupSequencer::new(Arc::clone(session), self.options.drain.clone());
        let action = TelephonyHangup::new(telephony.clone());
        let end = Arc::clone(end);
        let running = Arc::clone(running);
        tokio::spawn(async move {
            match sequencer.run(&action).await {
                HangupOutcome::Completed { .. } => end.finish(EndReason::Completed),
                HangupOutcome::DrainTimeout { .. } => end.finish(EndReason::DrainTimeout),
                HangupOutcome::NotReady | HangupOutcome::AlreadyTriggered => {}
            }
            running.store(false, Ordering::Release);
        });
    }

    /// Cut whatever is playing, play the apology clip and hang up.
    async fn apologize_and_hang_up(
        &self,
        session: &Arc<CallSession>,
        telephony: &mpsc::Sender<TelephonyCommand>,
    ) {
        effects::play_apology(session, telephony, &self.apology, &self.options.drain).await;
    }
}
