//! Session model state and the persistent-429 fallback handler.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use strand_providers::{GenerationError, PersistentRateLimitHandler, classify};
use strand_types::AuthType;

/// Low-cost model used after persistent rate limiting under Google login.
pub const FALLBACK_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug)]
struct ModelStateInner {
    model: String,
    in_fallback: bool,
}

/// Shared view of the session's active model.
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone)]
pub struct ModelState {
    inner: Arc<Mutex<ModelStateInner>>,
}

impl ModelState {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ModelStateInner {
                model: model.into(),
                in_fallback: false,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ModelStateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn current(&self) -> String {
        self.lock().model.clone()
    }

    #[must_use]
    pub fn in_fallback(&self) -> bool {
        self.lock().in_fallback
    }

    /// Select a model explicitly. Leaves fallback mode.
    pub fn set_model(&self, model: impl Into<String>) {
        let mut inner = self.lock();
        inner.model = model.into();
        inner.in_fallback = false;
    }

    /// Move to `fallback`. Returns `false` when already on it.
    pub fn switch_to_fallback(&self, fallback: &str) -> bool {
        let mut inner = self.lock();
        if inner.model == fallback {
            inner.in_fallback = true;
            return false;
        }
        inner.model = fallback.to_string();
        inner.in_fallback = true;
        true
    }
}

/// Decides what a persistent 429 means for each auth type.
///
/// - `LoginWithGoogle`: switch to [`FALLBACK_MODEL`] unless already there.
///   The generator factory has no adapter for this auth type yet, so only a
///   caller-supplied generator paired with it reaches this branch.
/// - `QwenOAuth`: never switches. Auth failures are left to the token
///   manager; throttling is left to backoff.
/// - Everything else: no action.
#[derive(Debug, Clone)]
pub struct FallbackHandler {
    state: ModelState,
    fallback_model: String,
}

impl FallbackHandler {
    #[must_use]
    pub fn new(state: ModelState) -> Self {
        Self {
            state,
            fallback_model: FALLBACK_MODEL.to_string(),
        }
    }

    #[must_use]
    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = model.into();
        self
    }

    fn handle_qwen(error: &GenerationError) {
        let message = error.to_string();
        if error.is_auth() || classify::is_auth_error(error.status(), &message) {
            tracing::warn!(
                "Qwen OAuth authentication error persisted after refresh; re-authentication may be required: {message}"
            );
        } else if classify::is_qwen_throttling_error(error.status(), &message) {
            tracing::warn!("Qwen API rate limit encountered: {message}");
        }
    }
}

#[async_trait]
impl PersistentRateLimitHandler for FallbackHandler {
    async fn on_persistent_429(
        &self,
        auth_type: Option<AuthType>,
        error: &GenerationError,
    ) -> Option<String> {
        match auth_type {
            Some(AuthType::QwenOAuth) => {
                Self::handle_qwen(error);
                None
            }
            Some(AuthType::LoginWithGoogle) => {
                let from = self.state.current();
                if !self.state.switch_to_fallback(&self.fallback_model) {
                    return None;
                }
                tracing::warn!(
                    from = %from,
                    to = %self.fallback_model,
                    "Persistent rate limiting, switching to fallback model"
                );
                Some(self.fallback_model.clone())
            }
            _ => None,
        }
    }
}
