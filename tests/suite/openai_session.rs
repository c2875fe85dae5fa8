//! Session over the OpenAI-compatible adapter against a mock server.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::json;
use strand_config::Settings;
use strand_engine::{Session, SessionConfig, SessionEvent, create_content_generator};
use strand_providers::RetryOptions;
use strand_types::{ApiKey, AuthType, FinishReason, FunctionResponse, Part, Role};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{
    UserSpeaksNext, drain, mount_chat_stream, openai_text_stream, sse_body, sse_response,
    streamed_text,
};

fn settings(server: &MockServer) -> Settings {
    Settings {
        openai_api_key: Some(ApiKey::new("sk-test")),
        openai_base_url: Some(format!("{}/v1", server.uri())),
        model: Some("gpt-4o".to_string()),
        ..Settings::default()
    }
}

async fn session(server: &MockServer, retry: RetryOptions) -> Session {
    let settings = settings(server);
    let (auth_tx, _auth_rx) = mpsc::unbounded_channel();
    let configured = create_content_generator(&settings, AuthType::OpenAi, auth_tx, &CancellationToken::new())
        .await
        .unwrap();
    let config = SessionConfig {
        retry,
        ..SessionConfig::from_settings(&settings, Some(AuthType::OpenAi))
    };
    Session::new(configured.generator, configured.model, config)
        .with_next_speaker_checker(Arc::new(UserSpeaksNext))
}

fn fast_retry() -> RetryOptions {
    RetryOptions {
        initial_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(5),
        ..RetryOptions::default()
    }
}

async fn send(session: &mut Session, parts: Vec<Part>) -> Vec<SessionEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .send_message(parts, "prompt-1", &CancellationToken::new(), &tx)
        .await;
    drain(&mut rx)
}

#[tokio::test]
async fn streams_text_and_records_history() {
    let server = MockServer::start().await;
    mount_chat_stream(&server, "/v1/chat/completions", openai_text_stream("Hello from the mock")).await;

    let mut session = session(&server, fast_retry()).await;
    let events = send(&mut session, vec![Part::text("hi")]).await;

    assert_eq!(streamed_text(&events), "Hello from the mock");
    assert_eq!(events.last(), Some(&SessionEvent::Finished(FinishReason::Stop)));
    assert_eq!(session.history().len(), 2);
    assert_eq!(session.history()[1].text(), "Hello from the mock");
}

#[tokio::test]
async fn tool_call_round_trip() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let tool_stream = sse_body(
        &[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "read_file", "arguments": "{\"pa"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "th\": \"a.rs\"}"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        ],
        true,
    );
    let text_stream = openai_text_stream("The file is empty.");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(move |request: &wiremock::Request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return sse_response(tool_stream.clone());
            }
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            let messages = body["messages"].as_array().unwrap();
            let tool = messages.iter().find(|m| m["role"] == "tool").unwrap();
            assert_eq!(tool["tool_call_id"], "call_1");
            let assistant = messages.iter().find(|m| m["role"] == "assistant").unwrap();
            assert_eq!(assistant["tool_calls"][0]["id"], "call_1");
            sse_response(text_stream.clone())
        })
        .expect(2)
        .mount(&server)
        .await;

    let mut session = session(&server, fast_retry()).await;
    let events = send(&mut session, vec![Part::text("read a.rs")]).await;
    let call = events
        .iter()
        .find_map(|event| match event {
            SessionEvent::FunctionCall(call) => Some(call.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(call.name, "read_file");
    assert_eq!(call.args, json!({"path": "a.rs"}));
    assert_eq!(events.last(), Some(&SessionEvent::Finished(FinishReason::ToolCalls)));

    let response = FunctionResponse::new(call.id.clone(), call.name.clone(), json!({"content": ""}));
    let events = send(&mut session, vec![Part::FunctionResponse(response)]).await;
    assert_eq!(streamed_text(&events), "The file is empty.");

    let history = session.history();
    assert_eq!(history.len(), 4);
    assert!(history[2].is_function_response());
    assert_eq!(history[3].role, Role::Model);
}

#[tokio::test]
async fn server_errors_are_retried_then_succeed() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let body = openai_text_stream("eventually");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(move |_: &wiremock::Request| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                ResponseTemplate::new(503).set_body_string("overloaded")
            } else {
                sse_response(body.clone())
            }
        })
        .mount(&server)
        .await;

    let mut session = session(&server, fast_retry()).await;
    let events = send(&mut session, vec![Part::text("hi")]).await;
    assert_eq!(streamed_text(&events), "eventually");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn quota_exhaustion_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "You exceeded your current quota", "code": "insufficient_quota"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = session(&server, fast_retry()).await;
    let events = send(&mut session, vec![Part::text("hi")]).await;
    let [SessionEvent::Error { stage, .. }] = events.as_slice() else {
        panic!("unexpected events: {events:?}");
    };
    assert_eq!(stage, "quota");
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn quota_error_inside_stream_is_reported_as_quota() {
    let server = MockServer::start().await;
    let body = sse_body(
        &[
            json!({"choices": [{"index": 0, "delta": {"content": "Hel"}}]}),
            json!({"error": {"message": "You exceeded your current quota", "code": "insufficient_quota"}}),
        ],
        false,
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response(body))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = session(&server, fast_retry()).await;
    let events = send(&mut session, vec![Part::text("hi")]).await;
    let Some(SessionEvent::Error { stage, .. }) = events.last() else {
        panic!("unexpected events: {events:?}");
    };
    assert_eq!(stage, "quota");
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn malformed_chunk_is_reported_as_protocol() {
    let server = MockServer::start().await;
    let body = sse_body(&[json!({"choices": "not a list"})], true);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response(body))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = session(&server, fast_retry()).await;
    let events = send(&mut session, vec![Part::text("hi")]).await;
    let Some(SessionEvent::Error { stage, .. }) = events.last() else {
        panic!("unexpected events: {events:?}");
    };
    assert_eq!(stage, "protocol");
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn token_limit_blocks_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let settings = settings(&server);
    let (auth_tx, _auth_rx) = mpsc::unbounded_channel();
    let configured = create_content_generator(&settings, AuthType::OpenAi, auth_tx, &CancellationToken::new())
        .await
        .unwrap();
    let mut session = Session::new(
        configured.generator,
        configured.model,
        SessionConfig {
            session_token_limit: 5,
            system_instruction: Some("You are a careful assistant. ".repeat(20)),
            ..SessionConfig::default()
        },
    );

    let events = send(&mut session, vec![Part::text("hi")]).await;
    assert!(matches!(
        events.as_slice(),
        [SessionEvent::SessionTokenLimitExceeded { limit: 5, .. }]
    ));
}
