//! Shared test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use strand_engine::{NextSpeaker, NextSpeakerChecker, SessionEvent};
use strand_types::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Always hands the turn back to the user, without a network call.
pub struct UserSpeaksNext;

#[async_trait]
impl NextSpeakerChecker for UserSpeaksNext {
    async fn check(
        &self,
        _history: &[Message],
        _model: &str,
        _cancel: &CancellationToken,
    ) -> Option<NextSpeaker> {
        Some(NextSpeaker::User)
    }
}

/// Encode `chunks` as an SSE body, optionally terminated by `[DONE]`.
pub fn sse_body(chunks: &[Value], done: bool) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

pub fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

/// OpenAI-compatible stream that answers with `text` split into words.
pub fn openai_text_stream(text: &str) -> String {
    let mut chunks: Vec<Value> = text
        .split_inclusive(' ')
        .map(|word| serde_json::json!({"choices": [{"index": 0, "delta": {"content": word}}]}))
        .collect();
    chunks.push(serde_json::json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}));
    chunks.push(serde_json::json!({
        "choices": [],
        "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
    }));
    sse_body(&chunks, true)
}

pub async fn mount_chat_stream(server: &MockServer, chat_path: &str, body: String) {
    Mock::given(method("POST"))
        .and(path(chat_path.to_string()))
        .respond_with(sse_response(body))
        .mount(server)
        .await;
}

/// Drain every event currently buffered on `rx`.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Concatenated `Content` events.
pub fn streamed_text(events: &[SessionEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Content(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

pub fn far_future_ms() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis();
    i64::try_from(now).unwrap() + 3_600_000
}
