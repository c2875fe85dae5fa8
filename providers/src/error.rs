use std::time::Duration;

use strand_types::StreamError;
use thiserror::Error;

use crate::classify;

#[derive(Debug, Error)]
pub enum GenerationError {
    /// Upstream payload could not be interpreted.
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error("authentication failed: {message}")]
    Auth { status: Option<u16>, message: String },
    #[error("quota exceeded: {message}")]
    QuotaExceeded { status: Option<u16>, message: String },
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("request cancelled")]
    Cancelled,
    #[error("no valid access token: {0}")]
    TokenUnavailable(String),
    #[error("API error {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    /// Error object reported by the provider inside an open stream.
    #[error("provider error: {0}")]
    Upstream(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GenerationError {
    /// Classify a non-success HTTP response.
    #[must_use]
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        if classify::is_quota_exceeded(&message) {
            return Self::QuotaExceeded {
                status: Some(status),
                message,
            };
        }
        match status {
            401 | 403 => Self::Auth {
                status: Some(status),
                message,
            },
            429 => Self::RateLimited {
                message,
                retry_after,
            },
            _ => Self::Http {
                status,
                message,
                retry_after,
            },
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. } | Self::QuotaExceeded { status, .. } => *status,
            Self::RateLimited { .. } => Some(429),
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Transient failures: throttling, 5xx, timeouts and connection errors.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) | Self::Timeout => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Auth { .. } => true,
            Self::Http { status, message, .. } => classify::is_auth_error(Some(*status), message),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// Short label for where a terminal failure originated.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Auth { .. } | Self::TokenUnavailable(_) => "auth",
            Self::QuotaExceeded { .. } => "quota",
            Self::Network(_) | Self::Timeout | Self::RateLimited { .. } => "network",
            Self::Protocol(_) => "protocol",
            Self::Configuration(_) => "configuration",
            Self::Cancelled | Self::Http { .. } | Self::Upstream(_) => "generation",
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Network(strand_utils::redact_secrets(&err.to_string()))
        }
    }
}

/// Classify a failure that ended a stream after it had started.
impl From<StreamError> for GenerationError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Network(message) => Self::Network(message),
            StreamError::Protocol(message) => Self::Protocol(message),
            StreamError::Upstream {
                status,
                code,
                message,
            } => {
                let signal = match &code {
                    Some(code) => format!("{code}: {message}"),
                    None => message.clone(),
                };
                if classify::is_quota_exceeded(&signal) {
                    return Self::QuotaExceeded { status, message };
                }
                if let Some(status) = status {
                    return Self::from_status(status, message, None);
                }
                if classify::is_auth_error(None, &signal) {
                    return Self::Auth {
                        status: None,
                        message,
                    };
                }
                if classify::is_qwen_throttling_error(None, &signal) {
                    return Self::RateLimited {
                        message,
                        retry_after: None,
                    };
                }
                Self::Upstream(message)
            }
        }
    }
}

impl From<strand_auth::AuthError> for GenerationError {
    fn from(err: strand_auth::AuthError) -> Self {
        match err {
            strand_auth::AuthError::Cancelled => Self::Cancelled,
            other => Self::TokenUnavailable(other.to_string()),
        }
    }
}

/// Pull a human-readable message out of an error body.
///
/// Understands `{"error": {"message": ..}}`, `{"error": "..",
/// "error_description": ..}` and `{"message": ..}`; anything else is returned
/// trimmed.
#[must_use]
pub fn extract_error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    let value = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    if let Some(message) = value
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(serde_json::Value::as_str)
    {
        return message.to_string();
    }
    if let Some(error) = value.get("error").and_then(serde_json::Value::as_str) {
        return match value
            .get("error_description")
            .and_then(serde_json::Value::as_str)
        {
            Some(description) => format!("{error}: {description}"),
            None => error.to_string(),
        };
    }
    if let Some(message) = value.get("message").and_then(serde_json::Value::as_str) {
        return message.to_string();
    }
    body.trim().to_string()
}
