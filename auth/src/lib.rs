//! OAuth2 device-flow credentials for the Qwen backend.
//!
//! # Architecture
//!
//! - [`pkce`] - verifier/challenge generation (RFC 7636, S256)
//! - [`credentials`] - on-disk credential record and its store
//! - [`oauth_client`] - raw HTTP exchanges against the authorization server
//! - [`device_flow`] - the polling state machine (RFC 8628) with progress events
//! - [`token_manager`] - cached access token with single-flight refresh
//!
//! Progress is reported through an [`AuthEvent`] channel handed to each flow
//! at construction; nothing here uses process-wide state.

pub mod credentials;
pub mod device_flow;
mod error;
pub mod oauth_client;
pub mod pkce;
pub mod token_manager;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use credentials::{CredentialStore, Credentials};
pub use device_flow::{
    AuthEvent, AuthProgress, AuthStatus, DeviceFlow, DeviceFlowOutcome, FailureReason,
};
pub use error::AuthError;
pub use oauth_client::{DeviceAuthorization, PollResponse, QwenOAuthClient, TokenResponse};
pub use pkce::PkcePair;
pub use token_manager::{AccessToken, TokenManager, normalize_endpoint};

/// Canonical Qwen OAuth authorization server.
pub const QWEN_OAUTH_BASE_URL: &str = "https://chat.qwen.ai";
pub const QWEN_OAUTH_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
pub const QWEN_OAUTH_SCOPE: &str = "openid profile email model.completion";
pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Default endpoint for Qwen generation calls when credentials carry no
/// `resource_url`.
pub const DEFAULT_QWEN_ENDPOINT: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Obtain usable credentials: refresh cached ones when present, otherwise
/// run the interactive device flow.
///
/// A cached record whose refresh token is rejected is cleared and reported as
/// an error; the caller decides whether to start a fresh device flow.
pub async fn authenticate(
    store: &CredentialStore,
    client: &QwenOAuthClient,
    events: mpsc::UnboundedSender<AuthEvent>,
    cancel: &CancellationToken,
) -> Result<Credentials, AuthError> {
    if let Some(cached) = store.load() {
        tracing::info!("Loaded cached Qwen credentials");
        if cached.refresh_token.is_none() && cached.is_valid(now_ms()) {
            return Ok(cached);
        }
        return match client.refresh(&cached, store, cancel).await {
            Ok(refreshed) => Ok(refreshed),
            Err(err) => {
                let message = if matches!(err, AuthError::RefreshTokenInvalid) {
                    "Cached credentials are invalid. Please re-authenticate.".to_string()
                } else {
                    format!("Token refresh failed: {err}")
                };
                let _ = events.send(AuthEvent::Progress(AuthProgress::new(
                    AuthStatus::Error,
                    message,
                )));
                Err(err)
            }
        };
    }

    let flow = DeviceFlow::new(client.clone(), store.clone(), events);
    flow.run(cancel).await.into_result()
}
