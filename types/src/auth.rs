use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the active backend is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthType {
    #[serde(rename = "oauth-personal")]
    LoginWithGoogle,
    #[serde(rename = "gemini-api-key")]
    GeminiApiKey,
    #[serde(rename = "vertex-ai")]
    VertexAi,
    #[serde(rename = "cloud-shell")]
    CloudShell,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "qwen-oauth")]
    QwenOAuth,
}

impl AuthType {
    pub const ALL: [AuthType; 6] = [
        AuthType::LoginWithGoogle,
        AuthType::GeminiApiKey,
        AuthType::VertexAi,
        AuthType::CloudShell,
        AuthType::OpenAi,
        AuthType::QwenOAuth,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AuthType::LoginWithGoogle => "oauth-personal",
            AuthType::GeminiApiKey => "gemini-api-key",
            AuthType::VertexAi => "vertex-ai",
            AuthType::CloudShell => "cloud-shell",
            AuthType::OpenAi => "openai",
            AuthType::QwenOAuth => "qwen-oauth",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown auth type: {0}")]
pub struct UnknownAuthType(pub String);

impl FromStr for AuthType {
    type Err = UnknownAuthType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        AuthType::ALL
            .into_iter()
            .find(|auth| auth.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownAuthType(trimmed.to_string()))
    }
}

/// A static API key. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(<redacted>)")
    }
}
