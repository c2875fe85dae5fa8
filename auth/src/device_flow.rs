//! RFC 8628 device authorization grant with PKCE.
//!
//! ```text
//! Idle -> Requesting -> Polling -> Succeeded | Cancelled | Expired | RateLimited | Failed
//! ```
//!
//! Each flow owns the sender half of its progress channel. The receiver sees
//! the [`DeviceAuthorization`] (to show the user code) followed by
//! [`AuthProgress`] updates for every poll and the terminal transition.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::credentials::{CredentialStore, Credentials};
use crate::error::AuthError;
use crate::oauth_client::{DeviceAuthorization, PollResponse, QwenOAuthClient};
use crate::pkce::PkcePair;

pub const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(2000);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10_000);

const CANCELLED_MESSAGE: &str = "Authentication cancelled by user.";
const EXPIRED_MESSAGE: &str = "Authorization timeout, please restart the process.";
const DEVICE_CODE_INVALID_MESSAGE: &str =
    "Device code expired or invalid, please restart the authorization process.";
const RATE_LIMITED_MESSAGE: &str =
    "Too many requests. The server is rate limiting our requests. Please try again later.";

#[derive(Debug, Clone)]
pub enum AuthEvent {
    DeviceAuthorization(DeviceAuthorization),
    Progress(AuthProgress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Polling {
        attempt: u32,
        max_attempts: u32,
        interval: Duration,
    },
    Success,
    Error,
    Timeout,
    RateLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthProgress {
    pub status: AuthStatus,
    pub message: String,
}

impl AuthProgress {
    pub fn new(status: AuthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The token endpoint answered 401 for the device code.
    DeviceCodeInvalid,
    /// The initial device authorization request failed.
    AuthorizationRequest(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::DeviceCodeInvalid => f.write_str(DEVICE_CODE_INVALID_MESSAGE),
            FailureReason::AuthorizationRequest(message) => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFlowOutcome {
    Succeeded(Credentials),
    Cancelled,
    Expired,
    RateLimited,
    Failed(FailureReason),
}

impl DeviceFlowOutcome {
    pub fn into_result(self) -> Result<Credentials, AuthError> {
        match self {
            DeviceFlowOutcome::Succeeded(credentials) => Ok(credentials),
            DeviceFlowOutcome::Cancelled => Err(AuthError::Cancelled),
            DeviceFlowOutcome::Expired => {
                Err(AuthError::DeviceAuthorization(EXPIRED_MESSAGE.to_string()))
            }
            DeviceFlowOutcome::RateLimited => {
                Err(AuthError::DeviceAuthorization(RATE_LIMITED_MESSAGE.to_string()))
            }
            DeviceFlowOutcome::Failed(reason) => {
                Err(AuthError::DeviceAuthorization(reason.to_string()))
            }
        }
    }
}

/// Interval after a poll; `slow_down` grows it by half, capped at
/// [`MAX_POLL_INTERVAL`].
#[must_use]
pub fn next_poll_interval(current: Duration, slow_down: bool) -> Duration {
    if slow_down {
        (current * 3 / 2).min(MAX_POLL_INTERVAL)
    } else {
        current
    }
}

/// `ceil(expires_in / interval)`.
#[must_use]
pub fn max_attempts(expires_in_secs: u64, interval: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    let total_ms = u128::from(expires_in_secs) * 1000;
    u32::try_from(total_ms.div_ceil(interval_ms)).unwrap_or(u32::MAX)
}

/// Sleep for `duration` unless cancelled first. Returns `false` on cancel.
async fn wait_with_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

pub struct DeviceFlow {
    client: QwenOAuthClient,
    store: CredentialStore,
    events: mpsc::UnboundedSender<AuthEvent>,
}

impl DeviceFlow {
    pub fn new(
        client: QwenOAuthClient,
        store: CredentialStore,
        events: mpsc::UnboundedSender<AuthEvent>,
    ) -> Self {
        Self {
            client,
            store,
            events,
        }
    }

    fn emit(&self, event: AuthEvent) {
        // Receiver may be gone; the flow still completes.
        let _ = self.events.send(event);
    }

    fn progress(&self, status: AuthStatus, message: impl Into<String>) {
        self.emit(AuthEvent::Progress(AuthProgress::new(status, message)));
    }

    fn cancelled(&self) -> DeviceFlowOutcome {
        tracing::info!("Device authorization cancelled");
        self.progress(AuthStatus::Error, CANCELLED_MESSAGE);
        DeviceFlowOutcome::Cancelled
    }

    pub async fn run(&self, cancel: &CancellationToken) -> DeviceFlowOutcome {
        if cancel.is_cancelled() {
            return self.cancelled();
        }

        let pkce = PkcePair::generate();
        let authorization = match self.client.request_device_authorization(&pkce, cancel).await
        {
            Ok(authorization) => authorization,
            Err(AuthError::Cancelled) => return self.cancelled(),
            Err(err) => {
                tracing::warn!("Device authorization request failed: {err}");
                let message = format!("Device authorization failed: {err}");
                self.progress(AuthStatus::Error, message.clone());
                return DeviceFlowOutcome::Failed(FailureReason::AuthorizationRequest(message));
            }
        };

        tracing::info!(
            verification_uri = %authorization.verification_uri,
            expires_in = authorization.expires_in,
            "Device authorization started"
        );
        self.emit(AuthEvent::DeviceAuthorization(authorization.clone()));

        let attempts = max_attempts(authorization.expires_in, INITIAL_POLL_INTERVAL);
        let mut interval = INITIAL_POLL_INTERVAL;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return self.cancelled();
            }

            self.progress(
                AuthStatus::Polling {
                    attempt,
                    max_attempts: attempts,
                    interval,
                },
                format!("Polling... (attempt {attempt}/{attempts})"),
            );

            match self
                .client
                .poll_device_token(&authorization.device_code, &pkce.verifier, cancel)
                .await
            {
                Ok(PollResponse::Success(token)) => {
                    let credentials = token.into_credentials(None, crate::now_ms());
                    if let Err(e) = self.store.save(&credentials) {
                        tracing::warn!(
                            path = %self.store.path().display(),
                            "Failed to cache credentials: {e}"
                        );
                    }
                    tracing::info!("Device authorization succeeded");
                    self.progress(
                        AuthStatus::Success,
                        "Authentication successful! Access token obtained.",
                    );
                    return DeviceFlowOutcome::Succeeded(credentials);
                }
                Ok(PollResponse::Pending) => {
                    tracing::debug!(attempt, "Authorization pending");
                }
                Ok(PollResponse::SlowDown) => {
                    interval = next_poll_interval(interval, true);
                    tracing::debug!(
                        attempt,
                        interval_ms = interval.as_millis() as u64,
                        "Server requested slow down"
                    );
                }
                Err(AuthError::Cancelled) => return self.cancelled(),
                Err(err) if err.status() == Some(401) => {
                    self.progress(AuthStatus::Error, DEVICE_CODE_INVALID_MESSAGE);
                    return DeviceFlowOutcome::Failed(FailureReason::DeviceCodeInvalid);
                }
                Err(err) if err.status() == Some(429) => {
                    self.progress(AuthStatus::RateLimit, RATE_LIMITED_MESSAGE);
                    return DeviceFlowOutcome::RateLimited;
                }
                Err(err) => {
                    tracing::warn!(attempt, "Token poll failed: {err}");
                    self.progress(
                        AuthStatus::Error,
                        format!("Error polling for token: {err}"),
                    );
                }
            }

            if !wait_with_cancel(interval, cancel).await {
                return self.cancelled();
            }
        }

        self.progress(AuthStatus::Timeout, EXPIRED_MESSAGE);
        DeviceFlowOutcome::Expired
    }
}
