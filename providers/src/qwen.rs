//! Qwen OAuth adapter.
//!
//! Composes an [`OpenAiGenerator`] with a [`TokenManager`]: each call asks the
//! manager for a valid `(token, endpoint)` pair and hands it to the inner
//! adapter as a request-scoped [`Endpoint`]. A credential rejection triggers
//! exactly one forced refresh and retry.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use strand_auth::TokenManager;
use strand_types::ApiKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::openai::{Endpoint, OpenAiGenerator, estimate_request_tokens};
use crate::{ContentGenerator, GenerationRequest, GenerationResponse, Result, StreamEvent};

pub const DEFAULT_QWEN_MODEL: &str = "qwen3-coder-plus";
const QWEN_EMBEDDING_MODEL: &str = "text-embedding-v4";

#[derive(Clone)]
pub struct QwenOAuthGenerator {
    inner: OpenAiGenerator,
    tokens: Arc<TokenManager>,
}

impl QwenOAuthGenerator {
    #[must_use]
    pub fn new(inner: OpenAiGenerator, tokens: Arc<TokenManager>) -> Self {
        Self { inner, tokens }
    }

    #[must_use]
    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    async fn with_valid_token<T, F, Fut>(&self, cancel: &CancellationToken, mut call: F) -> Result<T>
    where
        F: FnMut(Endpoint) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let token = self.tokens.valid_token(cancel).await?;
        let endpoint = Endpoint::new(token.endpoint.clone(), ApiKey::new(token.token.clone()));

        match call(endpoint).await {
            Err(err) if err.is_auth() => {
                tracing::warn!(
                    status = ?err.status(),
                    "Qwen rejected the access token, refreshing once: {err}"
                );
                let refreshed = self
                    .tokens
                    .refresh_after_auth_failure(&token.token, cancel)
                    .await?;
                call(Endpoint::new(refreshed.endpoint, ApiKey::new(refreshed.token))).await
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for QwenOAuthGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QwenOAuthGenerator")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ContentGenerator for QwenOAuthGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse> {
        self.with_valid_token(cancel, |endpoint| async move {
            self.inner.generate_at(&endpoint, request, cancel).await
        })
        .await
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.with_valid_token(cancel, |endpoint| {
            let tx = tx.clone();
            async move { self.inner.stream_at(&endpoint, request, tx, cancel).await }
        })
        .await
    }

    async fn count_tokens(
        &self,
        request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<u32> {
        Ok(estimate_request_tokens(request, Default::default()))
    }

    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        self.with_valid_token(cancel, |endpoint| async move {
            self.inner
                .embed_at(&endpoint, QWEN_EMBEDDING_MODEL, texts, cancel)
                .await
        })
        .await
    }
}
