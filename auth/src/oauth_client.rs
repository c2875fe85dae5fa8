//! HTTP exchanges with the OAuth authorization server.
//!
//! All requests are form-encoded and accept JSON. Every call takes a
//! [`CancellationToken`]; cancelling drops the in-flight request.

use std::future::Future;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::credentials::{CredentialStore, Credentials};
use crate::error::AuthError;
use crate::pkce::PkcePair;
use crate::{DEVICE_CODE_GRANT_TYPE, QWEN_OAUTH_BASE_URL, QWEN_OAUTH_CLIENT_ID, QWEN_OAUTH_SCOPE};

const DEVICE_CODE_PATH: &str = "/api/v1/oauth2/device/code";
const TOKEN_PATH: &str = "/api/v1/oauth2/token";
const MAX_ERROR_BODY_CHARS: usize = 2048;

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    /// Lifetime of the device code in seconds.
    pub expires_in: u64,
}

impl std::fmt::Debug for DeviceAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAuthorization")
            .field("device_code", &"<redacted>")
            .field("user_code", &self.user_code)
            .field("verification_uri", &self.verification_uri)
            .field("verification_uri_complete", &self.verification_uri_complete)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub resource_url: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("resource_url", &self.resource_url)
            .finish_non_exhaustive()
    }
}

impl TokenResponse {
    /// Build a credential record, keeping `previous_refresh` when the server
    /// did not rotate the refresh token.
    #[must_use]
    pub fn into_credentials(self, previous_refresh: Option<String>, now_ms: i64) -> Credentials {
        Credentials {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .filter(|token| !token.is_empty())
                .or(previous_refresh),
            token_type: self.token_type,
            resource_url: self.resource_url,
            expiry_date: self
                .expires_in
                .map(|secs| now_ms.saturating_add(secs.saturating_mul(1000))),
        }
    }
}

/// Result of one token poll that did not fail.
#[derive(Debug, Clone)]
pub enum PollResponse {
    /// `authorization_pending`: the user has not approved yet.
    Pending,
    /// `slow_down`: the client must poll less often.
    SlowDown,
    Success(TokenResponse),
}

#[derive(Debug, Default, Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl OAuthErrorBody {
    fn describe(&self) -> String {
        format!(
            "{} - {}",
            self.error.as_deref().unwrap_or("Unknown error"),
            self.error_description
                .as_deref()
                .unwrap_or("No details provided")
        )
    }
}

pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, AuthError>
where
    F: Future<Output = Result<T, AuthError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(AuthError::Cancelled),
        result = fut => result,
    }
}

fn truncate_body(body: &str) -> String {
    let redacted = strand_utils::redact_secrets(body.trim());
    if redacted.chars().count() > MAX_ERROR_BODY_CHARS {
        let truncated: String = redacted.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{truncated}...(truncated)")
    } else {
        redacted
    }
}

#[derive(Debug, Clone)]
pub struct QwenOAuthClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
}

impl QwenOAuthClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: QWEN_OAUTH_BASE_URL.to_string(),
            client_id: QWEN_OAUTH_CLIENT_ID.to_string(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Start a device authorization bound to `pkce`.
    pub async fn request_device_authorization(
        &self,
        pkce: &PkcePair,
        cancel: &CancellationToken,
    ) -> Result<DeviceAuthorization, AuthError> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("scope", QWEN_OAUTH_SCOPE),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", PkcePair::method()),
        ];

        cancellable(cancel, async {
            let response = self
                .http
                .post(self.url(DEVICE_CODE_PATH))
                .header("Accept", "application/json")
                .header("x-request-id", Uuid::new_v4().to_string())
                .form(&form)
                .send()
                .await?;

            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(AuthError::DeviceAuthorization(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    truncate_body(&body)
                )));
            }

            match serde_json::from_str::<DeviceAuthorization>(&body) {
                Ok(authorization) => Ok(authorization),
                Err(_) => {
                    let error: OAuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
                    Err(AuthError::DeviceAuthorization(error.describe()))
                }
            }
        })
        .await
    }

    /// Poll the token endpoint once for a pending device authorization.
    pub async fn poll_device_token(
        &self,
        device_code: &str,
        code_verifier: &str,
        cancel: &CancellationToken,
    ) -> Result<PollResponse, AuthError> {
        let form = [
            ("grant_type", DEVICE_CODE_GRANT_TYPE),
            ("client_id", self.client_id.as_str()),
            ("device_code", device_code),
            ("code_verifier", code_verifier),
        ];

        cancellable(cancel, async {
            let response = self
                .http
                .post(self.url(TOKEN_PATH))
                .header("Accept", "application/json")
                .form(&form)
                .send()
                .await?;

            let status = response.status().as_u16();
            let body = response.text().await?;

            if !(200..300).contains(&status) {
                let error: OAuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
                return match (status, error.error.as_deref()) {
                    (400, Some("authorization_pending")) => Ok(PollResponse::Pending),
                    (429, Some("slow_down")) => Ok(PollResponse::SlowDown),
                    _ => Err(AuthError::Http {
                        status,
                        body: if error.error.is_some() {
                            error.describe()
                        } else {
                            truncate_body(&body)
                        },
                    }),
                };
            }

            if let Ok(token) = serde_json::from_str::<TokenResponse>(&body) {
                return Ok(PollResponse::Success(token));
            }
            let error: OAuthErrorBody = serde_json::from_str(&body)
                .map_err(|e| AuthError::Protocol(format!("invalid token response: {e}")))?;
            match error.error.as_deref() {
                Some("authorization_pending") => Ok(PollResponse::Pending),
                Some("slow_down") => Ok(PollResponse::SlowDown),
                _ => Err(AuthError::Protocol(format!(
                    "Token polling failed: {}",
                    error.describe()
                ))),
            }
        })
        .await
    }

    /// Exchange the refresh token in `current` for fresh credentials and
    /// persist them.
    ///
    /// HTTP 400 means the refresh token is no longer accepted: the stored
    /// record is cleared and [`AuthError::RefreshTokenInvalid`] is returned.
    pub async fn refresh(
        &self,
        current: &Credentials,
        store: &CredentialStore,
        cancel: &CancellationToken,
    ) -> Result<Credentials, AuthError> {
        let Some(refresh_token) = current.refresh_token.as_deref() else {
            return Err(AuthError::TokenUnavailable(
                "no refresh token available".to_string(),
            ));
        };

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];

        let token = cancellable(cancel, async {
            let response = self
                .http
                .post(self.url(TOKEN_PATH))
                .header("Accept", "application/json")
                .form(&form)
                .send()
                .await?;

            let status = response.status().as_u16();
            let body = response.text().await?;

            if status == 400 {
                if let Err(e) = store.clear() {
                    tracing::warn!("Failed to clear invalid credentials: {e}");
                }
                return Err(AuthError::RefreshTokenInvalid);
            }
            if !(200..300).contains(&status) {
                return Err(AuthError::Http {
                    status,
                    body: truncate_body(&body),
                });
            }

            serde_json::from_str::<TokenResponse>(&body).map_err(|_| {
                let error: OAuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
                AuthError::Protocol(format!("Token refresh failed: {}", error.describe()))
            })
        })
        .await?;

        let credentials = token.into_credentials(current.refresh_token.clone(), crate::now_ms());
        if let Err(e) = store.save(&credentials) {
            tracing::warn!(path = %store.path().display(), "Failed to cache refreshed credentials: {e}");
        }
        tracing::debug!("Refreshed OAuth access token");
        Ok(credentials)
    }
}
