//! Forced history compaction through a live OpenAI-compatible generator.

use std::sync::Arc;

use serde_json::json;
use strand_config::Settings;
use strand_context::SNAPSHOT_ACKNOWLEDGEMENT;
use strand_engine::{Session, SessionConfig, create_content_generator};
use strand_types::{ApiKey, AuthType, Message, Role};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::UserSpeaksNext;

const SUMMARY: &str = "<state_snapshot>user asked about files</state_snapshot>";

async fn session(server: &MockServer) -> Session {
    let settings = Settings {
        openai_api_key: Some(ApiKey::new("sk-test")),
        openai_base_url: Some(format!("{}/v1", server.uri())),
        model: Some("gpt-4o".to_string()),
        ..Settings::default()
    };
    let (auth_tx, _auth_rx) = mpsc::unbounded_channel();
    let configured =
        create_content_generator(&settings, AuthType::OpenAi, auth_tx, &CancellationToken::new())
            .await
            .unwrap();
    Session::new(configured.generator, configured.model, SessionConfig::default())
        .with_next_speaker_checker(Arc::new(UserSpeaksNext))
}

fn long_history(turns: usize) -> Vec<Message> {
    (0..turns)
        .flat_map(|i| {
            [
                Message::user_text(format!("question {i}: {}", "please look at this file ".repeat(40))),
                Message::model_text(format!("answer {i}: {}", "the file contains code ".repeat(40))),
            ]
        })
        .collect()
}

#[tokio::test]
async fn forced_compression_replaces_old_turns_with_summary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(move |request: &wiremock::Request| {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            assert_ne!(body["stream"], json!(true));
            let messages = body["messages"].as_array().unwrap();
            assert_eq!(messages[0]["role"], "system");
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {"role": "assistant", "content": SUMMARY},
                    "finish_reason": "stop"
                }]
            }))
        })
        .expect(1)
        .mount(&server)
        .await;

    let mut session = session(&server).await;
    let original = long_history(5);
    session.set_history(original.clone());

    let result = session
        .try_compress(true, &CancellationToken::new())
        .await
        .unwrap()
        .expect("history should be compacted");
    assert!(result.new_token_count < result.original_token_count);

    let history = session.history();
    assert!(history.len() < original.len());
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text(), SUMMARY);
    assert_eq!(history[1].role, Role::Model);
    assert_eq!(history[1].text(), SNAPSHOT_ACKNOWLEDGEMENT);
    assert_eq!(history.last(), original.last());
}

#[tokio::test]
async fn empty_history_is_left_alone() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let mut session = session(&server).await;
    let result = session.try_compress(true, &CancellationToken::new()).await.unwrap();
    assert!(result.is_none());
    assert!(session.history().is_empty());
}
