//! Cached access token with single-flight refresh.
//!
//! The cached record lives behind one async mutex. A caller that finds the
//! token inside the refresh buffer refreshes while still holding the lock, so
//! concurrent callers queue on the lock and then observe the refreshed token
//! instead of issuing their own exchange.

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::credentials::{CredentialStore, Credentials};
use crate::error::AuthError;
use crate::oauth_client::QwenOAuthClient;
use crate::{DEFAULT_QWEN_ENDPOINT, now_ms};

/// A token ready for use together with the endpoint it is valid for.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub endpoint: String,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl AccessToken {
    fn from_credentials(credentials: &Credentials) -> Result<Self, AuthError> {
        if credentials.access_token.is_empty() {
            return Err(AuthError::TokenUnavailable(
                "credentials carry an empty access token".to_string(),
            ));
        }
        Ok(Self {
            token: credentials.access_token.clone(),
            endpoint: normalize_endpoint(credentials.resource_url.as_deref()),
        })
    }
}

/// Resolve the generation endpoint from a credential `resource_url`.
///
/// Falls back to [`DEFAULT_QWEN_ENDPOINT`], adds `https://` when no scheme is
/// present and appends `/v1` when missing.
#[must_use]
pub fn normalize_endpoint(resource_url: Option<&str>) -> String {
    let base = resource_url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .unwrap_or(DEFAULT_QWEN_ENDPOINT);
    let with_scheme = if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("https://{base}")
    };
    let trimmed = with_scheme.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

pub struct TokenManager {
    client: QwenOAuthClient,
    store: CredentialStore,
    state: Mutex<Option<Credentials>>,
}

impl TokenManager {
    /// Manager that lazily loads its record from `store`.
    pub fn new(client: QwenOAuthClient, store: CredentialStore) -> Self {
        Self {
            client,
            store,
            state: Mutex::new(None),
        }
    }

    /// Manager seeded with credentials that were just obtained.
    pub fn with_credentials(
        client: QwenOAuthClient,
        store: CredentialStore,
        credentials: Credentials,
    ) -> Self {
        Self {
            client,
            store,
            state: Mutex::new(Some(credentials)),
        }
    }

    /// Return a token outside the refresh buffer, refreshing when needed.
    pub async fn valid_token(&self, cancel: &CancellationToken) -> Result<AccessToken, AuthError> {
        let mut state = self.state.lock().await;
        let now = now_ms();

        if let Some(credentials) = state.as_ref()
            && credentials.is_valid(now)
        {
            return AccessToken::from_credentials(credentials);
        }

        // Another process may have refreshed the shared file.
        if let Some(stored) = self.store.load() {
            if stored.is_valid(now) {
                let token = AccessToken::from_credentials(&stored);
                *state = Some(stored);
                return token;
            }
            // A rotated refresh token in the store supersedes ours.
            let superseded = state
                .as_ref()
                .is_none_or(|current| current.refresh_token != stored.refresh_token);
            if superseded {
                *state = Some(stored);
            }
        }

        let Some(current) = state.clone() else {
            return Err(AuthError::TokenUnavailable(
                "no cached credentials, authenticate first".to_string(),
            ));
        };

        let refreshed = self.refresh_locked(&mut state, &current, cancel).await?;
        AccessToken::from_credentials(&refreshed)
    }

    /// Refresh after the server rejected `stale_token`.
    ///
    /// When another caller has already replaced that token, the replacement is
    /// returned without a network call.
    pub async fn refresh_after_auth_failure(
        &self,
        stale_token: &str,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, AuthError> {
        let mut state = self.state.lock().await;

        if let Some(credentials) = state.as_ref()
            && credentials.access_token != stale_token
            && credentials.is_valid(now_ms())
        {
            return AccessToken::from_credentials(credentials);
        }

        let current = match state.clone().or_else(|| self.store.load()) {
            Some(current) => current,
            None => {
                return Err(AuthError::TokenUnavailable(
                    "no cached credentials, authenticate first".to_string(),
                ));
            }
        };

        let refreshed = self.refresh_locked(&mut state, &current, cancel).await?;
        AccessToken::from_credentials(&refreshed)
    }

    async fn refresh_locked(
        &self,
        state: &mut Option<Credentials>,
        current: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<Credentials, AuthError> {
        tracing::debug!("Refreshing access token");
        match self.client.refresh(current, &self.store, cancel).await {
            Ok(refreshed) => {
                *state = Some(refreshed.clone());
                Ok(refreshed)
            }
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(AuthError::RefreshTokenInvalid) => {
                *state = None;
                Err(AuthError::TokenUnavailable(
                    AuthError::RefreshTokenInvalid.to_string(),
                ))
            }
            Err(AuthError::TokenUnavailable(message)) => Err(AuthError::TokenUnavailable(message)),
            Err(err) => {
                tracing::warn!("Access token refresh failed: {err}");
                Err(AuthError::TokenUnavailable(format!(
                    "failed to refresh access token: {err}"
                )))
            }
        }
    }

    /// Cached access token, possibly expired.
    pub async fn current_token(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = self.store.load();
        }
        state.as_ref().map(|credentials| credentials.access_token.clone())
    }

    /// Drop the in-memory record; the next call reloads from the store.
    pub async fn clear(&self) {
        *self.state.lock().await = None;
    }

    #[must_use]
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }
}
