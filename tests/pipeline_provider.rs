//! Pipeline provider (streaming STT, chat completions, speech synthesis)
//! against local stand-ins for all three legs.

mod mock_providers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mock_providers::stt_mock::{SttMockServer, results};
use mock_providers::{CallHarness, RecordingSink, business, directory};
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use waav_call_bridge::core::backpressure::BackpressureGovernor;
use waav_call_bridge::core::bridge::{BridgeOptions, CallBridge, DefaultProviderFactory};
use waav_call_bridge::core::provider::pipeline::{PipelineClient, PipelineSettings};
use waav_call_bridge::core::provider::{
    AiProvider, CallProfile, ConnectionState, FunctionCall, ProviderClient, ProviderEvent,
    ProviderSettings,
};
use waav_call_bridge::core::telephony::{TelephonyCommand, TelephonyEvent};

const TTS_BYTES: usize = 9600;

fn settings(http: &MockServer, stt_url: Option<&str>) -> PipelineSettings {
    PipelineSettings {
        stt_url: stt_url.unwrap_or("ws://127.0.0.1:9/v1/listen").to_string(),
        stt_api_key: "dg-test".to_string(),
        llm_base_url: http.uri(),
        llm_api_key: "sk-test".to_string(),
        tts_base_url: http.uri(),
        tts_api_key: "sk-test".to_string(),
        ..Default::default()
    }
}

fn profile(greeting: Option<&str>) -> CallProfile {
    CallProfile {
        voice_id: "nova".to_string(),
        instructions: Some("You are the front desk of a dental office.".to_string()),
        greeting: greeting.map(str::to_string),
    }
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

async fn mount_llm(server: &MockServer, body: serde_json::Value, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn mount_tts(server: &MockServer, delay: Duration, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .and(body_partial_json(json!({"response_format": "pcm", "voice": "nova"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; TTS_BYTES])
                .set_delay(delay),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn next_event(events: &mut mpsc::Receiver<ProviderEvent>) -> ProviderEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for provider event")
        .expect("event stream closed")
}

/// Events up to and including the turn's terminal event.
async fn collect_turn(events: &mut mpsc::Receiver<ProviderEvent>) -> Vec<ProviderEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let terminal = matches!(
            event,
            ProviderEvent::ResponseDone { .. } | ProviderEvent::ResponseCancelled { .. }
        );
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

/// Fail the next `times` requests to `endpoint` with a 503.
async fn mount_unavailable(server: &MockServer, endpoint: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .up_to_n_times(times)
        .expect(times)
        .mount(server)
        .await;
}

async fn next_transcription(events: &mut mpsc::Receiver<ProviderEvent>) -> String {
    loop {
        if let ProviderEvent::TranscriptionCompleted { text } = next_event(events).await {
            return text;
        }
    }
}

fn audio_bytes(events: &[ProviderEvent]) -> usize {
    events
        .iter()
        .map(|e| match e {
            ProviderEvent::AudioDelta { audio, .. } => audio.len(),
            _ => 0,
        })
        .sum()
}

#[tokio::test]
async fn test_caller_turn_flows_through_all_three_legs() {
    let http = MockServer::start().await;
    mount_llm(&http, completion("We open at nine."), 1).await;
    mount_tts(&http, Duration::ZERO, 1).await;
    let stt = SttMockServer::start().await;

    let client = PipelineClient::new(
        settings(&http, Some(&stt.url)),
        profile(None),
        BackpressureGovernor::new(),
    )
    .unwrap();
    let mut events = client.take_events().unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    client.wait_ready(Duration::from_secs(1)).await.unwrap();

    client.send_audio(Bytes::from(vec![0u8; 640])).await.unwrap();
    client.send_audio(Bytes::from(vec![0u8; 640])).await.unwrap();
    assert!(stt.wait_for_audio(2).await);

    let uri = stt.request_uri.lock().clone().unwrap();
    assert!(uri.starts_with("/v1/listen?"));
    assert!(uri.contains("encoding=linear16"));
    assert_eq!(stt.authorization.lock().as_deref(), Some("Token dg-test"));

    stt.say(json!({"type": "SpeechStarted", "channel": [0], "timestamp": 0.4}));
    stt.say(results("when do you", true, false));
    stt.say(results("open tomorrow", true, true));

    assert_eq!(next_event(&mut events).await, ProviderEvent::SpeechStarted);
    let text = loop {
        if let ProviderEvent::TranscriptionCompleted { text } = next_event(&mut events).await {
            break text;
        }
    };
    assert_eq!(text, "when do you open tomorrow");

    client.create_response(Some(text.clone())).await.unwrap();
    let turn = collect_turn(&mut events).await;

    let ProviderEvent::ResponseCreated { response_id } = &turn[0] else {
        panic!("turn must open with ResponseCreated, got {:?}", turn[0]);
    };
    assert!(matches!(turn[1], ProviderEvent::AudioDelta { .. }));
    assert_eq!(audio_bytes(&turn), TTS_BYTES);
    assert_eq!(
        turn[turn.len() - 2],
        ProviderEvent::AssistantTranscript {
            response_id: response_id.clone(),
            text: "We open at nine.".to_string()
        }
    );
    assert_eq!(
        turn.last(),
        Some(&ProviderEvent::ResponseDone {
            response_id: response_id.clone()
        })
    );

    let roles: Vec<String> = client.history().into_iter().map(|m| m.role).collect();
    assert_eq!(roles, vec!["system", "user", "assistant"]);

    client.disconnect().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_frames_dropped_while_turn_in_flight() {
    let http = MockServer::start().await;
    mount_llm(&http, completion("Let me check that for you."), 1).await;
    mount_tts(&http, Duration::from_secs(2), 1).await;

    let governor = BackpressureGovernor::new();
    let client = PipelineClient::new(settings(&http, None), profile(None), governor.clone()).unwrap();
    let mut events = client.take_events().unwrap();

    assert!(!governor.admit_or_drop());

    client
        .create_response(Some("can I move my appointment".to_string()))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ProviderEvent::ResponseCreated { .. }
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !governor.is_processing_turn() {
        assert!(tokio::time::Instant::now() < deadline, "turn never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Offer a telephony frame every 20ms for as long as synthesis is held.
    let mut offered = 0u64;
    let mut admitted = 0u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    while governor.is_processing_turn() {
        ticker.tick().await;
        offered += 1;
        if !governor.admit_or_drop() {
            admitted += 1;
        }
    }

    assert!(offered >= 50, "only {offered} frames offered in a 2s window");
    // At most the frame racing the end of the turn gets through.
    assert!(admitted <= 1);
    assert_eq!(governor.dropped_frames(), offered - admitted);

    let turn = collect_turn(&mut events).await;
    assert!(matches!(turn.last(), Some(ProviderEvent::ResponseDone { .. })));

    let dropped = governor.dropped_frames();
    assert!(!governor.is_processing_turn());
    assert!(!governor.admit_or_drop());
    assert_eq!(governor.dropped_frames(), dropped);
    assert_eq!(governor.turns_started(), 1);
}

#[tokio::test]
async fn test_end_call_tool_call_surfaces_without_speech() {
    let http = MockServer::start().await;
    mount_llm(
        &http,
        json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_bye",
                        "type": "function",
                        "function": {"name": "end_call", "arguments": "{\"reason\":\"caller said goodbye\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }),
        1,
    )
    .await;
    mount_tts(&http, Duration::ZERO, 0).await;

    let client =
        PipelineClient::new(settings(&http, None), profile(None), BackpressureGovernor::new())
            .unwrap();
    let mut events = client.take_events().unwrap();

    client
        .create_response(Some("that's all, thanks".to_string()))
        .await
        .unwrap();
    let turn = collect_turn(&mut events).await;

    assert!(turn.contains(&ProviderEvent::FunctionCall(FunctionCall {
        call_id: "call_bye".to_string(),
        name: "end_call".to_string(),
        arguments: "{\"reason\":\"caller said goodbye\"}".to_string(),
    })));
    assert_eq!(audio_bytes(&turn), 0);
    assert!(!turn
        .iter()
        .any(|e| matches!(e, ProviderEvent::AssistantTranscript { .. })));

    client
        .submit_function_result("call_bye", "{\"ok\":true}")
        .await
        .unwrap();
    let history = client.history();
    assert_eq!(history.last().unwrap().tool_call_id.as_deref(), Some("call_bye"));
}

#[tokio::test]
async fn test_cancel_mid_synthesis_releases_backpressure() {
    let http = MockServer::start().await;
    mount_llm(&http, completion("Our hygienist has openings on Friday."), 1).await;
    mount_tts(&http, Duration::from_secs(3), 1).await;

    let governor = BackpressureGovernor::new();
    let client = PipelineClient::new(settings(&http, None), profile(None), governor.clone()).unwrap();
    let mut events = client.take_events().unwrap();

    client
        .create_response(Some("any openings this week".to_string()))
        .await
        .unwrap();
    let ProviderEvent::ResponseCreated { response_id } = next_event(&mut events).await else {
        panic!("expected ResponseCreated");
    };
    assert!(client.is_turn_active());

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.cancel_response(&response_id).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        ProviderEvent::ResponseCancelled {
            response_id: response_id.clone()
        }
    );
    assert!(!client.is_turn_active());
    assert!(!governor.is_processing_turn());
    assert!(client.cancel_response(&response_id).await.is_err());
}

#[tokio::test]
async fn test_greeting_is_spoken_without_llm() {
    let http = MockServer::start().await;
    mount_llm(&http, completion("unused"), 0).await;
    mount_tts(&http, Duration::ZERO, 1).await;

    let client = PipelineClient::new(
        settings(&http, None),
        profile(Some("Thanks for calling Bright Smiles.")),
        BackpressureGovernor::new(),
    )
    .unwrap();
    let mut events = client.take_events().unwrap();

    client.create_response(None).await.unwrap();
    let turn = collect_turn(&mut events).await;

    assert!(turn.iter().any(|e| matches!(
        e,
        ProviderEvent::AssistantTranscript { text, .. } if text == "Thanks for calling Bright Smiles."
    )));
    assert_eq!(audio_bytes(&turn), TTS_BYTES);
}

#[tokio::test]
async fn test_llm_rejection_reports_error_and_closes_turn() {
    let http = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&http)
        .await;
    mount_tts(&http, Duration::ZERO, 0).await;

    let governor = BackpressureGovernor::new();
    let client = PipelineClient::new(settings(&http, None), profile(None), governor.clone()).unwrap();
    let mut events = client.take_events().unwrap();

    client.create_response(Some("hello?".to_string())).await.unwrap();
    let turn = collect_turn(&mut events).await;

    assert!(turn.iter().any(
        |e| matches!(e, ProviderEvent::Error { message } if message.contains("401"))
    ));
    assert!(matches!(turn.last(), Some(ProviderEvent::ResponseDone { .. })));
    assert!(!governor.is_processing_turn());
}

#[tokio::test]
async fn test_stt_socket_drop_reconnects_once() {
    let http = MockServer::start().await;
    let stt = SttMockServer::start().await;

    let client = PipelineClient::new(
        settings(&http, Some(&stt.url)),
        profile(None),
        BackpressureGovernor::new(),
    )
    .unwrap();
    let mut events = client.take_events().unwrap();
    client.connect().await.unwrap();
    assert!(stt.wait_for_connections(1).await);

    stt.drop_connection();
    assert_eq!(
        next_event(&mut events).await,
        ProviderEvent::Reconnected {
            attempt: 1,
            responses_lost: false
        }
    );
    assert!(stt.wait_for_connections(2).await);
    client.wait_ready(Duration::from_secs(1)).await.unwrap();

    client.send_audio(Bytes::from(vec![0u8; 640])).await.unwrap();
    assert!(stt.wait_for_audio(1).await);

    stt.say(results("are you still there", true, true));
    assert_eq!(next_transcription(&mut events).await, "are you still there");

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_stt_second_drop_closes_the_provider() {
    let http = MockServer::start().await;
    let stt = SttMockServer::start().await;

    let client = PipelineClient::new(
        settings(&http, Some(&stt.url)),
        profile(None),
        BackpressureGovernor::new(),
    )
    .unwrap();
    let mut events = client.take_events().unwrap();
    client.connect().await.unwrap();

    stt.drop_connection();
    assert!(matches!(
        next_event(&mut events).await,
        ProviderEvent::Reconnected { attempt: 1, .. }
    ));

    stt.drop_connection();
    assert!(matches!(
        next_event(&mut events).await,
        ProviderEvent::Closed { .. }
    ));
    assert!(client.wait_ready(Duration::from_millis(100)).await.is_err());
    assert!(client.send_audio(Bytes::from(vec![0u8; 640])).await.is_err());
    assert_eq!(stt.connections.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_llm_unavailable_once_is_retried() {
    let http = MockServer::start().await;
    mount_unavailable(&http, "/chat/completions", 1).await;
    mount_llm(&http, completion("We open at nine."), 1).await;
    mount_tts(&http, Duration::ZERO, 1).await;

    let client =
        PipelineClient::new(settings(&http, None), profile(None), BackpressureGovernor::new())
            .unwrap();
    let mut events = client.take_events().unwrap();

    client
        .create_response(Some("when do you open".to_string()))
        .await
        .unwrap();
    let turn = collect_turn(&mut events).await;

    assert!(!turn.iter().any(|e| matches!(e, ProviderEvent::Error { .. })));
    assert_eq!(audio_bytes(&turn), TTS_BYTES);
    assert!(turn.iter().any(|e| matches!(
        e,
        ProviderEvent::AssistantTranscript { text, .. } if text == "We open at nine."
    )));
}

#[tokio::test]
async fn test_tts_unavailable_once_is_retried() {
    let http = MockServer::start().await;
    mount_llm(&http, completion("We open at nine."), 1).await;
    mount_unavailable(&http, "/audio/speech", 1).await;
    mount_tts(&http, Duration::ZERO, 1).await;

    let client =
        PipelineClient::new(settings(&http, None), profile(None), BackpressureGovernor::new())
            .unwrap();
    let mut events = client.take_events().unwrap();

    client
        .create_response(Some("when do you open".to_string()))
        .await
        .unwrap();
    let turn = collect_turn(&mut events).await;

    assert!(!turn.iter().any(|e| matches!(e, ProviderEvent::Error { .. })));
    assert_eq!(audio_bytes(&turn), TTS_BYTES);
}

#[tokio::test]
async fn test_llm_unavailable_twice_fails_the_turn() {
    let http = MockServer::start().await;
    mount_unavailable(&http, "/chat/completions", 2).await;
    mount_llm(&http, completion("unused"), 0).await;
    mount_tts(&http, Duration::ZERO, 0).await;

    let governor = BackpressureGovernor::new();
    let client = PipelineClient::new(settings(&http, None), profile(None), governor.clone()).unwrap();
    let mut events = client.take_events().unwrap();

    client.create_response(Some("hello?".to_string())).await.unwrap();
    let turn = collect_turn(&mut events).await;

    assert!(turn.iter().any(
        |e| matches!(e, ProviderEvent::Error { message } if message.contains("503"))
    ));
    assert!(matches!(turn.last(), Some(ProviderEvent::ResponseDone { .. })));
    assert!(!governor.is_processing_turn());
}

#[tokio::test]
async fn test_reply_with_unknown_tool_is_spoken_before_follow_up() {
    let http = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Let me check on that.",
                    "tool_calls": [{
                        "id": "call_wx",
                        "type": "function",
                        "function": {"name": "lookup_weather", "arguments": "{\"city\":\"Austin\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&http)
        .await;
    mount_llm(&http, completion("I can't look up the weather, sorry."), 1).await;
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .and(body_partial_json(json!({"response_format": "pcm"})))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; TTS_BYTES]))
        .expect(2)
        .mount(&http)
        .await;
    let stt = SttMockServer::start().await;

    let providers = ProviderSettings {
        pipeline: settings(&http, Some(&stt.url)),
        ..Default::default()
    };
    let (sink, _outcomes) = RecordingSink::new();
    let bridge = Arc::new(CallBridge::new(
        directory(business(AiProvider::Pipeline, None)),
        Arc::new(DefaultProviderFactory::new(providers)),
        sink,
        BridgeOptions::default(),
    ));
    let mut harness = CallHarness::start(bridge, HashMap::new());
    assert!(stt.wait_for_connections(1).await);

    stt.say(results("what's the weather in Austin", true, true));

    // 200ms of synthesized audio per turn
    let mut media = 0;
    while media < 20 {
        let command = tokio::time::timeout(Duration::from_secs(5), harness.commands.recv())
            .await
            .expect("timed out waiting for assistant audio")
            .expect("telephony channel closed");
        if matches!(command, TelephonyCommand::Media(_)) {
            media += 1;
        }
    }

    harness.inbound.send(TelephonyEvent::Stopped).await.unwrap();
    let outcome = harness.call.await.unwrap();
    assert_eq!(
        outcome.ai_responses,
        vec![
            "Let me check on that.".to_string(),
            "I can't look up the weather, sorry.".to_string()
        ]
    );

    let requests = http.received_requests().await.unwrap();
    let spoken: Vec<String> = requests
        .iter()
        .filter(|r| r.url.path() == "/audio/speech")
        .map(|r| r.body_json::<serde_json::Value>().unwrap()["input"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(spoken, vec!["Let me check on that.", "I can't look up the weather, sorry."]);

    let completions: Vec<serde_json::Value> = requests
        .iter()
        .filter(|r| r.url.path() == "/chat/completions")
        .map(|r| r.body_json().unwrap())
        .collect();
    assert_eq!(completions.len(), 2);
    let follow_up = completions[1]["messages"].as_array().unwrap();
    assert!(follow_up
        .iter()
        .any(|m| m["role"] == "tool" && m["tool_call_id"] == "call_wx"));
}
