//! Qwen OAuth end to end: device flow, cached credentials, streamed chat.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::json;
use strand_auth::{AuthEvent, AuthStatus, CredentialStore};
use strand_config::Settings;
use strand_engine::{Session, SessionConfig, create_content_generator};
use strand_types::{AuthType, Part};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{UserSpeaksNext, drain, mount_chat_stream, openai_text_stream, streamed_text};

async fn mount_authorization_server(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v1/oauth2/device/code"))
        .and(body_string_contains("code_challenge_method=S256"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "device_code": "dev-e2e",
            "user_code": "ABCD-EFGH",
            "verification_uri": format!("{}/authorize", server.uri()),
            "verification_uri_complete": format!("{}/authorize?user_code=ABCD-EFGH", server.uri()),
            "expires_in": 600
        })))
        .expect(1)
        .mount(server)
        .await;

    let polls = Arc::new(AtomicU32::new(0));
    let resource_url = server.uri();
    Mock::given(method("POST"))
        .and(path("/api/v1/oauth2/token"))
        .and(body_string_contains("device_code=dev-e2e"))
        .respond_with(move |_: &wiremock::Request| {
            if polls.fetch_add(1, Ordering::SeqCst) == 0 {
                return ResponseTemplate::new(400)
                    .set_body_json(json!({"error": "authorization_pending"}));
            }
            ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "device-token",
                "refresh_token": "device-refresh",
                "token_type": "Bearer",
                "expires_in": 3600,
                "resource_url": resource_url
            }))
        })
        .expect(2)
        .mount(server)
        .await;
}

#[tokio::test]
async fn device_flow_then_chat() {
    let server = MockServer::start().await;
    mount_authorization_server(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer device-token"))
        .respond_with(crate::common::sse_response(openai_text_stream("Hi from Qwen")))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let creds_path = dir.path().join("oauth_creds.json");
    let settings = Settings {
        qwen_oauth_base_url: Some(server.uri()),
        qwen_credentials_path: Some(creds_path.clone()),
        ..Settings::default()
    };

    let (auth_tx, mut auth_rx) = mpsc::unbounded_channel();
    let configured = create_content_generator(
        &settings,
        AuthType::QwenOAuth,
        auth_tx,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut auth_events = Vec::new();
    while let Ok(event) = auth_rx.try_recv() {
        auth_events.push(event);
    }
    assert!(auth_events.iter().any(|event| matches!(
        event,
        AuthEvent::DeviceAuthorization(authorization) if authorization.user_code == "ABCD-EFGH"
    )));
    let polls = auth_events
        .iter()
        .filter(|event| {
            matches!(event, AuthEvent::Progress(progress) if matches!(progress.status, AuthStatus::Polling { .. }))
        })
        .count();
    assert_eq!(polls, 2);
    assert!(matches!(
        auth_events.last(),
        Some(AuthEvent::Progress(progress)) if progress.status == AuthStatus::Success
    ));

    let cached = CredentialStore::new(&creds_path).load().unwrap();
    assert_eq!(cached.access_token, "device-token");
    assert_eq!(cached.refresh_token.as_deref(), Some("device-refresh"));

    let tokens = configured.token_manager.clone().unwrap();
    assert_eq!(tokens.current_token().await.as_deref(), Some("device-token"));

    let mut session = Session::new(configured.generator, configured.model, SessionConfig::default())
        .with_next_speaker_checker(Arc::new(UserSpeaksNext));
    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .send_message(vec![Part::text("hello")], "p", &CancellationToken::new(), &tx)
        .await;
    assert_eq!(streamed_text(&drain(&mut rx)), "Hi from Qwen");
}

#[tokio::test]
async fn cached_credentials_skip_the_device_flow() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/oauth2/device/code"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    mount_chat_stream(&server, "/v1/chat/completions", openai_text_stream("cached ok")).await;

    let dir = tempfile::tempdir().unwrap();
    let creds_path = dir.path().join("oauth_creds.json");
    CredentialStore::new(&creds_path)
        .save(&strand_auth::Credentials {
            access_token: "cached-token".to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            resource_url: Some(server.uri()),
            expiry_date: Some(crate::common::far_future_ms()),
        })
        .unwrap();

    let settings = Settings {
        qwen_oauth_base_url: Some(server.uri()),
        qwen_credentials_path: Some(creds_path),
        ..Settings::default()
    };
    let (auth_tx, _auth_rx) = mpsc::unbounded_channel();
    let configured = create_content_generator(
        &settings,
        AuthType::QwenOAuth,
        auth_tx,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut session = Session::new(configured.generator, configured.model, SessionConfig::default())
        .with_next_speaker_checker(Arc::new(UserSpeaksNext));
    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .send_message(vec![Part::text("hello")], "p", &CancellationToken::new(), &tx)
        .await;
    assert_eq!(streamed_text(&drain(&mut rx)), "cached ok");
}
