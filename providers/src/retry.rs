//! Retry policy with exponential backoff and model fallback.
//!
//! # Policy
//!
//! - Max attempts: 5 (overridable via `max_retries`)
//! - Initial delay: 5s, doubling per attempt
//! - Max delay: 30s
//! - Jitter: down-jitter up to 30% (multiplier in [0.7, 1.0])
//! - `Retry-After` / `Retry-After-Ms` win over the computed delay
//!
//! # Retryable Conditions
//!
//! - HTTP 429 that is not quota exhaustion
//! - HTTP 5xx
//! - Timeouts and connection errors
//!
//! Everything else (quota, auth, malformed requests, protocol errors,
//! cancellation) surfaces on the first occurrence.
//!
//! # Persistent 429
//!
//! After [`RetryOptions::persistent_429_threshold`] consecutive 429s the
//! optional [`PersistentRateLimitHandler`] is consulted. When it names a new
//! model the attempt counter resets and the next attempt carries that model in
//! its [`RetryContext`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use strand_types::AuthType;
use tokio_util::sync::CancellationToken;

use crate::{GenerationError, Result};

#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Down-jitter factor (0.3 = up to 30% reduction).
    pub jitter_factor: f64,
    pub persistent_429_threshold: u32,
    pub auth_type: Option<AuthType>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5000),
            max_delay: Duration::from_millis(30_000),
            jitter_factor: 0.3,
            persistent_429_threshold: 2,
            auth_type: None,
        }
    }
}

impl RetryOptions {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_auth_type(mut self, auth_type: AuthType) -> Self {
        self.auth_type = Some(auth_type);
        self
    }
}

/// Per-attempt view handed to the retried operation.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub auth_type: Option<AuthType>,
    /// 1-based attempt number since the last reset.
    pub attempt: u32,
    pub last_error: Option<String>,
    /// Model chosen by the persistent-429 handler, when it switched.
    pub model: Option<String>,
}

#[async_trait]
pub trait PersistentRateLimitHandler: Send + Sync {
    /// Called after repeated 429s. Returning a model name retries with it.
    async fn on_persistent_429(
        &self,
        auth_type: Option<AuthType>,
        error: &GenerationError,
    ) -> Option<String>;
}

/// Parse `Retry-After` or `Retry-After-Ms` headers.
///
/// Returns `Some(duration)` if a valid value is found and `0 < duration < 60s`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(val) = headers.get("retry-after-ms")
        && let Ok(s) = val.to_str()
        && let Ok(ms) = s.parse::<f64>()
        && ms.is_finite()
        && ms > 0.0
    {
        let duration = Duration::from_secs_f64(ms / 1000.0);
        if duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    if let Some(val) = headers.get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if duration > Duration::ZERO && duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    None
}

/// Exponential backoff with down-jitter.
///
/// `backoff_step` is 0 before the first retry, 1 before the second, and so on.
#[must_use]
pub fn calculate_retry_delay(backoff_step: u32, options: &RetryOptions) -> Duration {
    let exponent = i32::try_from(backoff_step).unwrap_or(i32::MAX).min(30);
    let base = options.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(options.max_delay.as_secs_f64());

    let jitter = 1.0 - rand::random::<f64>() * options.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry_with_backoff<T, F, Fut>(
    mut op: F,
    options: &RetryOptions,
    handler: Option<&dyn PersistentRateLimitHandler>,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: FnMut(RetryContext) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut context = RetryContext {
        auth_type: options.auth_type,
        ..RetryContext::default()
    };
    let mut consecutive_429 = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        context.attempt += 1;

        let err = match op(context.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        if err.status() == Some(429) {
            consecutive_429 += 1;
        } else {
            consecutive_429 = 0;
        }

        if consecutive_429 >= options.persistent_429_threshold
            && let Some(handler) = handler
            && let Some(model) = handler.on_persistent_429(options.auth_type, &err).await
        {
            tracing::info!(%model, "Retrying with fallback model after persistent rate limiting");
            context.attempt = 0;
            context.model = Some(model);
            context.last_error = Some(err.to_string());
            consecutive_429 = 0;
            continue;
        }

        if context.attempt >= options.max_attempts {
            tracing::warn!(
                attempts = context.attempt,
                "Giving up after retryable error: {err}"
            );
            return Err(err);
        }

        let delay = err
            .retry_after()
            .unwrap_or_else(|| calculate_retry_delay(context.attempt - 1, options));
        tracing::debug!(
            attempt = context.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying request"
        );
        context.last_error = Some(err.to_string());

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GenerationError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
