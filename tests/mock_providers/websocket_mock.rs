//! In-process realtime WebSocket server
//!
//! Speaks enough of the OpenAI Realtime protocol to exercise the client:
//! `session.created` on connect, `session.updated` after a configurable
//! delay, a short scripted response per `response.create`, and a cancelled
//! `response.done` per `response.cancel`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
pub struct RealtimeMockConfig {
    /// Delay before `session.updated`; `None` never confirms.
    pub update_delay: Option<Duration>,
    /// Close the first connection right after confirming it.
    pub drop_first_connection: bool,
    /// μ-law frames per scripted response.
    pub response_frames: usize,
}

impl Default for RealtimeMockConfig {
    fn default() -> Self {
        Self {
            update_delay: Some(Duration::from_millis(0)),
            drop_first_connection: false,
            response_frames: 2,
        }
    }
}

pub struct RealtimeMockServer {
    pub url: String,
    pub received: Arc<Mutex<Vec<Value>>>,
    pub connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl RealtimeMockServer {
    pub async fn start(config: RealtimeMockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock realtime server");
        let addr = listener.local_addr().expect("mock server address");
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let handle = {
            let received = Arc::clone(&received);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let drop_after_update = config.drop_first_connection && index == 0;
                    tokio::spawn(handle_connection(
                        stream,
                        config.clone(),
                        Arc::clone(&received),
                        drop_after_update,
                    ));
                }
            })
        };

        Self {
            url: format!("ws://{addr}"),
            received,
            connections,
            handle,
        }
    }

    /// Received client events of `event_type`.
    pub fn received_of(&self, event_type: &str) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter(|e| e["type"] == event_type)
            .cloned()
            .collect()
    }
}

impl Drop for RealtimeMockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: RealtimeMockConfig,
    received: Arc<Mutex<Vec<Value>>>,
    drop_after_update: bool,
) {
    let Ok(ws_stream) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws_stream.split();

    let created = json!({"type": "session.created", "session": {"id": "sess_mock"}});
    if write
        .send(Message::Text(created.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut responses = 0usize;
    while let Some(Ok(message)) = read.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        received.lock().push(event.clone());

        let replies = match event["type"].as_str().unwrap_or_default() {
            "session.update" => {
                let Some(delay) = config.update_delay else {
                    continue;
                };
                tokio::time::sleep(delay).await;
                let updated = json!({
                    "type": "session.updated",
                    "session": {
                        "id": "sess_mock",
                        "input_audio_format": event["session"]["input_audio_format"],
                    }
                });
                if write
                    .send(Message::Text(updated.to_string().into()))
                    .await
                    .is_err()
                {
                    return;
                }
                if drop_after_update {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                continue;
            }
            "response.create" => {
                responses += 1;
                let id = format!("resp_{responses}");
                let audio = BASE64.encode(vec![0x55u8; 160 * config.response_frames]);
                vec![
                    json!({"type": "response.created", "response": {"id": id, "status": "in_progress"}}),
                    json!({"type": "response.audio.delta", "response_id": id, "item_id": "item_1", "delta": audio}),
                    json!({"type": "response.audio_transcript.done", "response_id": id, "transcript": "How can I help?"}),
                    json!({"type": "response.done", "response": {"id": id, "status": "completed"}}),
                ]
            }
            "response.cancel" => {
                let id = event["response_id"].as_str().unwrap_or_default();
                vec![json!({"type": "response.done", "response": {"id": id, "status": "cancelled"}})]
            }
            _ => Vec::new(),
        };

        for reply in replies {
            if write
                .send(Message::Text(reply.to_string().into()))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}
