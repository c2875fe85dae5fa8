//! Settings source for Strand.
//!
//! Values come from `~/.strand/config.toml` (all sections optional) and are
//! then overridden by environment variables. The resolved [`Settings`] is the
//! only shape the rest of the workspace sees.
//!
//! ```toml
//! [general]
//! model = "qwen3-coder-plus"
//! auth_type = "qwen-oauth"
//! max_session_turns = 50
//!
//! [generation]
//! timeout_secs = 120
//! max_retries = 5
//!
//! [sampling]
//! temperature = 0.0
//!
//! [api_keys]
//! openai = "${OPENAI_API_KEY}"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use strand_types::{ApiKey, AuthType, SamplingParams};
use thiserror::Error;

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Default, Deserialize)]
pub struct StrandConfig {
    pub general: Option<GeneralConfig>,
    pub generation: Option<GenerationConfig>,
    pub sampling: Option<SamplingConfig>,
    pub api_keys: Option<ApiKeys>,
    pub endpoints: Option<EndpointsConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid setting {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            ConfigError::Invalid { .. } => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GeneralConfig {
    pub model: Option<String>,
    pub auth_type: Option<String>,
    pub proxy: Option<String>,
    /// 0 disables the per-session turn limit.
    #[serde(default)]
    pub max_session_turns: u32,
    /// 0 disables the per-session token limit.
    #[serde(default)]
    pub session_token_limit: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerationConfig {
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub enable_openai_logging: bool,
    pub openai_log_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SamplingConfig {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
}

#[derive(Default, Deserialize)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub gemini: Option<String>,
}

// Manual Debug impl to prevent leaking API keys in logs.
impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn mask(opt: Option<&String>) -> &'static str {
            if opt.is_some() { "[REDACTED]" } else { "None" }
        }
        f.debug_struct("ApiKeys")
            .field("openai", &mask(self.openai.as_ref()))
            .field("gemini", &mask(self.gemini.as_ref()))
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EndpointsConfig {
    pub openai_base_url: Option<String>,
    pub gemini_base_url: Option<String>,
    pub qwen_oauth_base_url: Option<String>,
    pub qwen_credentials_path: Option<String>,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub model: Option<String>,
    pub auth_type: Option<AuthType>,
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub sampling: SamplingParams,
    pub max_session_turns: u32,
    pub session_token_limit: u32,
    pub enable_openai_logging: bool,
    pub openai_log_dir: Option<PathBuf>,
    pub openai_api_key: Option<ApiKey>,
    pub openai_base_url: Option<String>,
    pub gemini_api_key: Option<ApiKey>,
    pub gemini_base_url: Option<String>,
    pub qwen_oauth_base_url: Option<String>,
    pub qwen_credentials_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: None,
            auth_type: None,
            proxy: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            sampling: SamplingParams::default(),
            max_session_turns: 0,
            session_token_limit: 0,
            enable_openai_logging: false,
            openai_log_dir: None,
            openai_api_key: None,
            openai_base_url: None,
            gemini_api_key: None,
            gemini_base_url: None,
            qwen_oauth_base_url: None,
            qwen_credentials_path: None,
        }
    }
}

/// Expand `${VAR}` references using `lookup`. Unknown variables become empty.
pub fn expand_env_vars(value: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut i = 0;

    while i < value.len() {
        if value[i..].starts_with("${") {
            let start = i + 2;
            if let Some(end_rel) = value[start..].find('}') {
                let end = start + end_rel;
                let var = &value[start..end];
                if !var.is_empty() {
                    out.push_str(&lookup(var).unwrap_or_default());
                }
                i = end + 1;
                continue;
            }
        }

        let Some(ch) = value[i..].chars().next() else {
            break;
        };
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl StrandConfig {
    /// Parse the config file at `path`. A missing file yields `Ok(None)`.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }
}

impl Settings {
    /// Load `~/.strand/config.toml` and apply process environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match config_path() {
            Some(path) => StrandConfig::load_from(&path)?,
            None => None,
        };
        Self::resolve(config.unwrap_or_default(), &|name: &str| std::env::var(name).ok())
    }

    /// Merge a parsed config with environment overrides supplied by `env`.
    pub fn resolve(
        config: StrandConfig,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let general = config.general.unwrap_or_default();
        let generation = config.generation.unwrap_or_default();
        let sampling = config.sampling.unwrap_or_default();
        let keys = config.api_keys.unwrap_or_default();
        let endpoints = config.endpoints.unwrap_or_default();

        let auth_type = match non_empty(env("STRAND_AUTH_TYPE")).or(general.auth_type) {
            Some(raw) => Some(raw.parse::<AuthType>().map_err(|e| ConfigError::Invalid {
                field: "auth_type",
                message: e.to_string(),
            })?),
            None => None,
        };

        let openai_key = non_empty(env("OPENAI_API_KEY"))
            .or_else(|| non_empty(keys.openai.map(|k| expand_env_vars(&k, env))));
        let gemini_key = non_empty(env("GEMINI_API_KEY"))
            .or_else(|| non_empty(keys.gemini.map(|k| expand_env_vars(&k, env))));

        let model = non_empty(env("STRAND_MODEL"))
            .or_else(|| {
                matches!(auth_type, Some(AuthType::OpenAi))
                    .then(|| non_empty(env("OPENAI_MODEL")))
                    .flatten()
            })
            .or(general.model);

        Ok(Self {
            model,
            auth_type,
            proxy: non_empty(env("STRAND_PROXY")).or(general.proxy),
            timeout: Duration::from_secs(generation.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            max_retries: generation.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            sampling: SamplingParams {
                temperature: sampling.temperature,
                top_p: sampling.top_p,
                top_k: sampling.top_k,
                max_output_tokens: sampling.max_tokens,
            },
            max_session_turns: general.max_session_turns,
            session_token_limit: general.session_token_limit,
            enable_openai_logging: generation.enable_openai_logging,
            openai_log_dir: generation.openai_log_dir.map(PathBuf::from),
            openai_api_key: openai_key.map(ApiKey::new),
            openai_base_url: non_empty(env("OPENAI_BASE_URL")).or(endpoints.openai_base_url),
            gemini_api_key: gemini_key.map(ApiKey::new),
            gemini_base_url: endpoints.gemini_base_url,
            qwen_oauth_base_url: endpoints.qwen_oauth_base_url,
            qwen_credentials_path: endpoints.qwen_credentials_path.map(PathBuf::from),
        })
    }
}

#[must_use]
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".strand"))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}
