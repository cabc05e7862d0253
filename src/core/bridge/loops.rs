use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::CallEnd;
use crate::core::codec::{AudioFormat, FRAME_MS, FrameCodec};
use crate::core::persistence::EndReason;
use crate::core::provider::ProviderClient;
use crate::core::session::CallSession;
use crate::core::telephony::{TelephonyCommand, TelephonyEvent};

/// Caller audio to the provider.
///
/// Frames arriving while a pipeline turn runs are dropped, not buffered.
pub(super) async fn rx_loop(
    session: Arc<CallSession>,
    provider: Arc<dyn ProviderClient>,
    mut inbound: mpsc::Receiver<TelephonyEvent>,
    end: Arc<CallEnd>,
) {
    let call_id = session.call_id();
    let codec = FrameCodec::new(provider.input_format(), provider.output_format());
    let mut send_failures: u64 = 0;

    loop {
        let event = tokio::select! {
            _ = end.token().cancelled() => break,
            event = inbound.recv() => event,
        };

        match event {
            Some(TelephonyEvent::Audio(frame)) => {
                if !session.governor.admit_or_drop() {
                    continue;
                }
                if let Err(e) = provider.send_audio(codec.to_provider(&frame)).await {
                    send_failures += 1;
                    if send_failures == 1 || send_failures % 250 == 0 {
                        warn!(call_id, send_failures, "failed to forward caller audio: {}", e);
                    }
                }
            }
            Some(TelephonyEvent::Mark(name)) => debug!(call_id, mark = %name, "playback mark"),
            Some(TelephonyEvent::Dtmf(digit)) => info!(call_id, digit = %digit, "dtmf received"),
            Some(TelephonyEvent::Stopped) | None => {
                info!(call_id, "telephony stream closed");
                end.finish(EndReason::CallerHungUp);
                break;
            }
        }
    }

    let dropped = session.governor.dropped_frames();
    if dropped > 0 {
        info!(call_id, dropped, "caller frames dropped during turns");
    }
}

/// Provider audio to the caller.
///
/// Every tick converts whatever provider audio is queued into 20ms μ-law
/// frames, then sends frames until the endpoint holds `lead` of unplayed
/// audio. Stale frames never leave this loop.
pub(super) async fn tx_loop(
    session: Arc<CallSession>,
    provider_output: AudioFormat,
    telephony: mpsc::Sender<TelephonyCommand>,
    cancel: CancellationToken,
    lead: Duration,
) {
    let call_id = session.call_id();
    let mut codec = FrameCodec::new(AudioFormat::G711Ulaw, provider_output);
    let mut codec_generation = session.generation();
    let mut stale_dropped: u64 = 0;

    let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        refill(&session, &mut codec, &mut codec_generation);

        let now = Instant::now();
        while session.buffered_playout(now) < lead {
            let Some(frame) = session.tx_queue.pop() else {
                break;
            };
            if session.is_stale(&frame) {
                stale_dropped += 1;
                continue;
            }
            if telephony
                .send(TelephonyCommand::Media(frame.payload))
                .await
                .is_err()
            {
                debug!(call_id, "telephony writer gone");
                return;
            }
            session.record_frame_sent(now, Duration::from_millis(frame.duration_ms as u64));
        }
    }

    if stale_dropped > 0 {
        debug!(call_id, stale_dropped, "stale frames discarded");
    }
}

/// Move provider audio into the TX queue as telephony frames.
fn refill(session: &CallSession, codec: &mut FrameCodec, codec_generation: &mut u64) {
    let generation = session.generation();
    if generation != *codec_generation {
        codec.reset();
        *codec_generation = generation;
    }

    while let Some(chunk) = session.provider_queue.pop() {
        if chunk.generation < generation {
            continue;
        }
        let frames = codec
            .to_telephony(&chunk.payload)
            .into_iter()
            .map(|payload| session.make_frame_at(payload, FRAME_MS, chunk.generation))
            .collect::<Vec<_>>();
        session.tx_queue.extend(frames);
    }

    // Finish the tail of a response once nothing more is coming for it.
    if session.active_response_id().is_none()
        && let Some(tail) = codec.flush()
    {
        session
            .tx_queue
            .push(session.make_frame_at(tail, FRAME_MS, generation));
    }
}
