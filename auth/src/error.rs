use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// No usable access token could be produced.
    #[error("no valid access token available: {0}")]
    TokenUnavailable(String),
    #[error("device authorization failed: {0}")]
    DeviceAuthorization(String),
    #[error("Refresh token expired or invalid. Please re-authenticate.")]
    RefreshTokenInvalid,
    #[error("OAuth endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected OAuth response: {0}")]
    Protocol(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("credential storage failed: {0}")]
    Storage(#[from] std::io::Error),
}

impl AuthError {
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::Http { status, .. } => Some(*status),
            AuthError::Network(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
