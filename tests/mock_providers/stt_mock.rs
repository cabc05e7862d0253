//! In-process streaming STT server
//!
//! Accepts listener sockets one at a time, counts the binary audio frames it
//! receives and forwards whatever JSON the test scripts back to the client.
//! A scripted drop closes the current socket so the client has to reconnect.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

enum Scripted {
    Say(Value),
    Drop,
}

pub struct SttMockServer {
    pub url: String,
    /// Request URI of the accepted socket, query included.
    pub request_uri: Arc<Mutex<Option<String>>>,
    pub authorization: Arc<Mutex<Option<String>>>,
    pub audio_frames: Arc<AtomicUsize>,
    /// Control messages (`KeepAlive`, `CloseStream`) seen from the client.
    pub control: Arc<Mutex<Vec<Value>>>,
    /// Sockets accepted so far.
    pub connections: Arc<AtomicUsize>,
    script: mpsc::UnboundedSender<Scripted>,
    handle: JoinHandle<()>,
}

impl SttMockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock stt server");
        let addr = listener.local_addr().expect("mock stt address");
        let request_uri = Arc::new(Mutex::new(None));
        let authorization = Arc::new(Mutex::new(None));
        let audio_frames = Arc::new(AtomicUsize::new(0));
        let control = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (script, mut script_rx) = mpsc::unbounded_channel::<Scripted>();

        let handle = {
            let request_uri = Arc::clone(&request_uri);
            let authorization = Arc::clone(&authorization);
            let audio_frames = Arc::clone(&audio_frames);
            let control = Arc::clone(&control);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                        *request_uri.lock() = Some(request.uri().to_string());
                        *authorization.lock() = request
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        Ok(response)
                    };
                    let Ok(ws_stream) = accept_hdr_async(stream, callback).await else {
                        continue;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (mut write, mut read) = ws_stream.split();

                    loop {
                        tokio::select! {
                            scripted = script_rx.recv() => {
                                match scripted {
                                    Some(Scripted::Say(message)) => {
                                        if write.send(Message::Text(message.to_string().into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(Scripted::Drop) => {
                                        let _ = write.send(Message::Close(None)).await;
                                        break;
                                    }
                                    None => return,
                                }
                            }
                            incoming = read.next() => {
                                match incoming {
                                    Some(Ok(Message::Binary(_))) => {
                                        audio_frames.fetch_add(1, Ordering::SeqCst);
                                    }
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                            control.lock().push(value);
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(_)) | None => break,
                                }
                            }
                        }
                    }
                }
            })
        };

        Self {
            url: format!("ws://{addr}/v1/listen"),
            request_uri,
            authorization,
            audio_frames,
            control,
            connections,
            script,
            handle,
        }
    }

    /// Push one server message to the connected client.
    pub fn say(&self, message: Value) {
        let _ = self.script.send(Scripted::Say(message));
    }

    /// Close the current socket from the server side.
    pub fn drop_connection(&self) {
        let _ = self.script.send(Scripted::Drop);
    }

    /// Wait until at least `count` sockets have been accepted.
    pub async fn wait_for_connections(&self, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if self.connections.load(Ordering::SeqCst) >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Wait until at least `count` audio frames have arrived.
    pub async fn wait_for_audio(&self, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if self.audio_frames.load(Ordering::SeqCst) >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub fn saw_control(&self, kind: &str) -> bool {
        self.control.lock().iter().any(|m| m["type"] == kind)
    }
}

impl Drop for SttMockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A `Results` message for one transcript segment.
pub fn results(transcript: &str, is_final: bool, speech_final: bool) -> Value {
    serde_json::json!({
        "type": "Results",
        "is_final": is_final,
        "speech_final": speech_final,
        "channel": {"alternatives": [{"transcript": transcript, "confidence": 0.93}]}
    })
}
