//! Builds the content generator for the selected auth type.

use std::sync::Arc;

use strand_auth::{
    AuthError, AuthEvent, CredentialStore, QwenOAuthClient, TokenManager, authenticate,
};
use strand_config::Settings;
use strand_providers::interaction_log::InteractionLogger;
use strand_providers::qwen::DEFAULT_QWEN_MODEL;
use strand_providers::{
    ContentGenerator, Endpoint, GeminiGenerator, GenerationError, OpenAiGenerator,
    QwenOAuthGenerator, http_client,
};
use strand_types::AuthType;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl SetupError {
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Auth(AuthError::DeviceAuthorization(_)) => "device-flow",
            Self::Auth(_) => "auth",
            Self::Generation(err) => err.stage(),
        }
    }
}

/// A ready generator plus the model it should be driven with.
pub struct ConfiguredGenerator {
    pub generator: Arc<dyn ContentGenerator>,
    pub model: String,
    pub auth_type: AuthType,
    /// Present for Qwen OAuth.
    pub token_manager: Option<Arc<TokenManager>>,
}

impl std::fmt::Debug for ConfiguredGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredGenerator")
            .field("model", &self.model)
            .field("auth_type", &self.auth_type)
            .finish_non_exhaustive()
    }
}

fn interaction_logger(settings: &Settings) -> Option<InteractionLogger> {
    if !settings.enable_openai_logging {
        return None;
    }
    let dir = settings
        .openai_log_dir
        .clone()
        .or_else(InteractionLogger::default_dir);
    if dir.is_none() {
        tracing::warn!("OpenAI logging enabled but no log directory could be determined");
    }
    dir.map(InteractionLogger::new)
}

fn openai_adapter(http: reqwest::Client, settings: &Settings) -> OpenAiGenerator {
    let adapter = OpenAiGenerator::new(http).with_sampling(settings.sampling);
    match interaction_logger(settings) {
        Some(logger) => adapter.with_logger(logger),
        None => adapter,
    }
}

/// Create the generator for `auth_type`.
///
/// Qwen OAuth authenticates first: cached credentials are refreshed when
/// needed, otherwise the device flow runs and reports progress on `events`.
pub async fn create_content_generator(
    settings: &Settings,
    auth_type: AuthType,
    events: mpsc::UnboundedSender<AuthEvent>,
    cancel: &CancellationToken,
) -> Result<ConfiguredGenerator, SetupError> {
    let http = http_client(settings.proxy.as_deref(), Some(settings.timeout))?;

    match auth_type {
        AuthType::GeminiApiKey | AuthType::VertexAi => {
            let key = settings.gemini_api_key.clone().ok_or_else(|| {
                SetupError::Configuration("GEMINI_API_KEY is not set".to_string())
            })?;
            let mut generator = GeminiGenerator::new(http, key);
            if let Some(base_url) = &settings.gemini_base_url {
                generator = generator.with_base_url(base_url.clone());
            }
            Ok(ConfiguredGenerator {
                generator: Arc::new(generator),
                model: settings
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
                auth_type,
                token_manager: None,
            })
        }
        AuthType::OpenAi => {
            let key = settings.openai_api_key.clone().ok_or_else(|| {
                SetupError::Configuration("OPENAI_API_KEY is not set".to_string())
            })?;
            let base_url = settings
                .openai_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
            let generator = openai_adapter(http, settings).with_endpoint(Endpoint::new(base_url, key));
            Ok(ConfiguredGenerator {
                generator: Arc::new(generator),
                model: settings
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
                auth_type,
                token_manager: None,
            })
        }
        AuthType::QwenOAuth => {
            let store = settings
                .qwen_credentials_path
                .clone()
                .map(CredentialStore::new)
                .or_else(CredentialStore::default_location)
                .ok_or_else(|| {
                    SetupError::Configuration(
                        "cannot locate the Qwen credentials file; set qwen_credentials_path"
                            .to_string(),
                    )
                })?;
            let mut client = QwenOAuthClient::new(http.clone());
            if let Some(base_url) = &settings.qwen_oauth_base_url {
                client = client.with_base_url(base_url.clone());
            }

            let credentials = authenticate(&store, &client, events, cancel).await?;
            let tokens = Arc::new(TokenManager::with_credentials(client, store, credentials));
            let generator = QwenOAuthGenerator::new(openai_adapter(http, settings), Arc::clone(&tokens));
            Ok(ConfiguredGenerator {
                generator: Arc::new(generator),
                model: settings
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_QWEN_MODEL.to_string()),
                auth_type,
                token_manager: Some(tokens),
            })
        }
        AuthType::LoginWithGoogle | AuthType::CloudShell => Err(SetupError::Configuration(
            format!("auth type {auth_type} has no content generator adapter yet"),
        )),
    }
}
