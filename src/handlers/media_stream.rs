//! Telephony media stream WebSocket handler
//!
//! The carrier opens one socket per call and speaks the Media Streams JSON
//! protocol. Nothing happens until `start` arrives: it carries the call id,
//! the stream sid and the custom parameters the bridge needs. After that a
//! reader task turns frames into [`TelephonyEvent`]s and a writer task turns
//! [`TelephonyCommand`]s back into frames, while [`CallBridge::run`] drives
//! the call between them.
//!
//! [`CallBridge::run`]: crate::core::bridge::CallBridge::run

use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::bridge::CallStart;
use crate::core::telephony::{InboundMessage, TelephonyCommand, TelephonyEvent};
use crate::middleware::ClientIp;
use crate::state::AppState;

/// Channel depth between the socket tasks and the bridge, in frames.
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Media Streams frames are small; anything larger is not ours.
const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long the writer may keep flushing after the bridge returns.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    let client_ip = client_ip.map(|Extension(ip)| ip);
    debug!(ip = ?client_ip, "media stream upgrade requested");

    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .max_frame_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            handle_media_socket(socket, Arc::clone(&state)).await;
            if let Some(ClientIp(ip)) = client_ip {
                state.release_connection(ip);
            }
        })
}

async fn handle_media_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let start =
        match tokio::time::timeout(state.config.start_timeout(), wait_for_start(&mut receiver))
            .await
        {
            Ok(Some(start)) => start,
            Ok(None) => {
                info!("media stream closed before start");
                return;
            }
            Err(_) => {
                warn!(
                    timeout_ms = state.config.start_timeout_ms,
                    "no start message received, closing media stream"
                );
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        };

    let call_id = start.call_id.clone();
    let stream_sid = start.stream_sid.clone();
    info!(call_id = %call_id, stream_sid = %stream_sid, "media stream started");

    let (event_tx, event_rx) = mpsc::channel::<TelephonyEvent>(CHANNEL_BUFFER_SIZE);
    let (command_tx, command_rx) = mpsc::channel::<TelephonyCommand>(CHANNEL_BUFFER_SIZE);

    let mut writer = tokio::spawn(write_commands(sender, command_rx, stream_sid));
    let reader = tokio::spawn(read_events(receiver, event_tx, call_id.clone()));

    let outcome = state.bridge.run(start, event_rx, command_tx).await;
    info!(
        call_id = %call_id,
        reason = %outcome.end_reason.as_str(),
        duration_ms = outcome.duration_ms,
        "media stream finished"
    );

    reader.abort();
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        warn!(call_id = %call_id, "telephony writer did not finish, aborting");
        writer.abort();
    }
}

/// Read until `start`, skipping `connected` and anything unparseable.
/// Returns `None` if the socket ends first.
pub(crate) async fn wait_for_start<S>(receiver: &mut S) -> Option<CallStart>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        match serde_json::from_str::<InboundMessage>(text.as_str()) {
            Ok(InboundMessage::Start { stream_sid, start }) => {
                return Some(CallStart {
                    call_id: start.call_sid,
                    stream_sid,
                    parameters: start.custom_parameters,
                });
            }
            Ok(InboundMessage::Connected { protocol }) => {
                debug!(protocol = ?protocol, "media stream connected");
            }
            Ok(other) => debug!(?other, "ignoring message before start"),
            Err(e) => warn!("unparseable media stream message: {}", e),
        }
    }
    None
}

/// Forward carrier frames to the bridge until `stop`, a close, or the
/// bridge going away. The bridge always sees a final `Stopped`.
pub(crate) async fn read_events<S>(
    mut receiver: S,
    events: mpsc::Sender<TelephonyEvent>,
    call_id: String,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut malformed = 0u64;
    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(call_id = %call_id, "media stream read error: {}", e);
                break;
            }
        };

        let parsed = serde_json::from_str::<InboundMessage>(text.as_str())
            .map_err(|e| e.to_string())
            .and_then(|m| TelephonyEvent::from_message(m).map_err(|e| e.to_string()));
        let event = match parsed {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                malformed += 1;
                if malformed == 1 || malformed % 100 == 0 {
                    warn!(call_id = %call_id, malformed, "dropping malformed media message: {}", e);
                }
                continue;
            }
        };

        let stopped = event == TelephonyEvent::Stopped;
        if events.send(event).await.is_err() || stopped {
            return;
        }
    }
    let _ = events.send(TelephonyEvent::Stopped).await;
}

/// Serialize bridge commands onto the socket. `Hangup` closes it.
pub(crate) async fn write_commands<S>(
    mut sender: S,
    mut commands: mpsc::Receiver<TelephonyCommand>,
    stream_sid: String,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(command) = commands.recv().await {
        let Some(message) = command.to_message(&stream_sid) else {
            info!(stream_sid = %stream_sid, "closing media stream");
            let _ = sender.send(Message::Close(None)).await;
            return;
        };
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize telephony message: {}", e);
                continue;
            }
        };
        if let Err(e) = sender.send(Message::Text(json.into())).await {
            debug!(stream_sid = %stream_sid, "media stream write failed: {}", e);
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}
