//! Session over the native Gemini adapter against a mock server.

use std::sync::Arc;

use serde_json::json;
use strand_config::Settings;
use strand_engine::{Session, SessionConfig, SessionEvent, create_content_generator};
use strand_types::{
    ApiKey, AuthType, FinishReason, FunctionCall, FunctionResponse, Message, Part, Role,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{UserSpeaksNext, drain, sse_body, sse_response, streamed_text};

const STREAM_PATH: &str = "/models/gemini-2.5-pro:streamGenerateContent";

fn candidate(text: &str, finish: Option<&str>) -> serde_json::Value {
    let mut candidate = json!({"content": {"role": "model", "parts": [{"text": text}]}});
    if let Some(reason) = finish {
        candidate["finishReason"] = json!(reason);
    }
    json!({"candidates": [candidate]})
}

async fn gemini_session(server: &MockServer, config: SessionConfig) -> Session {
    let settings = Settings {
        gemini_api_key: Some(ApiKey::new("g-test")),
        gemini_base_url: Some(server.uri()),
        model: Some("gemini-2.5-pro".to_string()),
        ..Settings::default()
    };
    let (auth_tx, _auth_rx) = mpsc::unbounded_channel();
    let configured = create_content_generator(
        &settings,
        AuthType::GeminiApiKey,
        auth_tx,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    Session::new(configured.generator, configured.model, config)
        .with_next_speaker_checker(Arc::new(UserSpeaksNext))
}

async fn send(session: &mut Session, text: &str) -> Vec<SessionEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .send_message(vec![Part::text(text)], "p", &CancellationToken::new(), &tx)
        .await;
    drain(&mut rx)
}

#[tokio::test]
async fn streams_candidates_and_usage() {
    let server = MockServer::start().await;
    let mut last = candidate("world", Some("STOP"));
    last["usageMetadata"] = json!({
        "promptTokenCount": 7,
        "candidatesTokenCount": 2,
        "totalTokenCount": 9
    });
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(query_param("alt", "sse"))
        .and(header("x-goog-api-key", "g-test"))
        .respond_with(sse_response(sse_body(&[candidate("Hello ", None), last], false)))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = gemini_session(&server, SessionConfig::default()).await;
    let events = send(&mut session, "hi").await;

    assert_eq!(streamed_text(&events), "Hello world");
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::Usage(usage) if usage.prompt_tokens == 7 && usage.completion_tokens == 2
    )));
    assert_eq!(events.last(), Some(&SessionEvent::Finished(FinishReason::Stop)));

    let history = session.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].text(), "Hello world");
}

#[tokio::test]
async fn request_carries_history_and_system_instruction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-pro:countTokens"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"totalTokens": 12})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(move |request: &wiremock::Request| {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Answer briefly.");
            let contents = body["contents"].as_array().unwrap();
            assert_eq!(contents.len(), 3);
            assert_eq!(contents[1]["role"], "model");
            assert_eq!(contents[2]["parts"][0]["text"], "and now?");
            sse_response(sse_body(&[candidate("ok", Some("STOP"))], false))
        })
        .expect(1)
        .mount(&server)
        .await;

    let config = SessionConfig {
        system_instruction: Some("Answer briefly.".to_string()),
        ..SessionConfig::default()
    };
    let mut session = gemini_session(&server, config).await;
    session.set_history(vec![
        Message::user_text("earlier question"),
        Message::model_text("earlier answer"),
    ]);

    let events = send(&mut session, "and now?").await;
    assert_eq!(streamed_text(&events), "ok");
    assert_eq!(session.history().len(), 4);
}

#[tokio::test]
async fn stream_error_event_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(sse_response(sse_body(
            &[json!({"error": {"code": 400, "message": "Request contains an invalid argument."}})],
            false,
        )))
        .mount(&server)
        .await;

    let mut session = gemini_session(&server, SessionConfig::default()).await;
    let events = send(&mut session, "hi").await;
    let Some(SessionEvent::Error { stage, message }) = events.last() else {
        panic!("unexpected events: {events:?}");
    };
    assert_eq!(stage, "generation");
    assert!(message.contains("invalid argument"));
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn exhausted_quota_inside_stream_is_reported_as_quota() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(sse_response(sse_body(
            &[
                candidate("Hel", None),
                json!({"error": {
                    "code": 429,
                    "status": "RESOURCE_EXHAUSTED",
                    "message": "Quota exceeded for quota metric 'Generate Content API requests per minute'"
                }}),
            ],
            false,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = gemini_session(&server, SessionConfig::default()).await;
    let events = send(&mut session, "hi").await;
    let Some(SessionEvent::Error { stage, .. }) = events.last() else {
        panic!("unexpected events: {events:?}");
    };
    assert_eq!(stage, "quota");
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn function_response_without_matching_call_is_never_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(sse_response(sse_body(&[candidate("ok", Some("STOP"))], false)))
        .expect(0)
        .mount(&server)
        .await;

    let mut session = gemini_session(&server, SessionConfig::default()).await;
    let history = vec![
        Message::user_text("list files"),
        Message::new(
            Role::Model,
            vec![Part::FunctionCall(FunctionCall::new("call-1", "ls", json!({})))],
        ),
    ];
    session.set_history(history.clone());

    let err = session
        .add_function_responses(vec![FunctionResponse::new("ghost", "ls", json!({"files": []}))])
        .unwrap_err();
    assert!(err.to_string().contains("ghost"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .send_message(
            vec![Part::FunctionResponse(FunctionResponse::new(
                "ghost2",
                "ls",
                json!({"files": []}),
            ))],
            "p",
            &CancellationToken::new(),
            &tx,
        )
        .await;
    let events = drain(&mut rx);
    let [SessionEvent::Error { stage, message }] = events.as_slice() else {
        panic!("unexpected events: {events:?}");
    };
    assert_eq!(stage, "protocol");
    assert!(message.contains("ghost2"));
    assert_eq!(session.history(), history.as_slice());
}
