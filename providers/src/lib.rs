//! Content generators with a single provider-neutral contract.
//!
//! # Architecture
//!
//! - [`ContentGenerator`] - the async contract every backend implements
//! - [`gemini`] - native pass-through to the Gemini `generateContent` API
//! - [`openai`] - OpenAI-compatible Chat Completions
//! - [`qwen`] - OpenAI-compatible wire format behind OAuth device-flow tokens
//! - [`retry`] - backoff policy with persistent-429 model fallback
//! - [`classify`] - quota, throttling and auth predicates
//!
//! # Streaming Events
//!
//! All backends normalize their output to [`StreamEvent`]:
//!
//! | Event | Description |
//! |-------|-------------|
//! | `TextDelta` | Incremental text content from the model |
//! | `FunctionCall` | A complete function call (arguments fully received) |
//! | `Usage` | Token consumption metrics |
//! | `Finished` | Stream completed with a finish reason |
//! | `Error` | Stream terminated with an error after it started |
//!
//! # Error Handling
//!
//! Failures before the first byte of a stream return `Err` so the retry
//! policy can act on them. Once events have started flowing, failures are
//! delivered as a terminal `StreamEvent::Error`, allowing partial output to be
//! kept.

pub mod classify;
mod error;
pub mod gemini;
pub mod interaction_log;
pub mod openai;
pub mod qwen;
pub mod retry;
mod sse_types;
pub mod token_estimate;
pub mod tool_hygiene;

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
pub(crate) use strand_types::{
    FunctionCall, GenerationRequest, GenerationResponse, Message, StreamError, StreamEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use error::{GenerationError, extract_error_message};
pub use gemini::GeminiGenerator;
pub use openai::{Endpoint, OpenAiGenerator};
pub use qwen::QwenOAuthGenerator;
pub use retry::{
    PersistentRateLimitHandler, RetryContext, RetryOptions, calculate_retry_delay,
    parse_retry_after, retry_with_backoff,
};
pub use strand_types;

pub type Result<T, E = GenerationError> = std::result::Result<T, E>;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;

const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// The provider-neutral generation contract.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse>;

    /// Stream normalized events into `tx`.
    ///
    /// Returns `Err` only for failures before the stream started.
    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn count_tokens(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<u32>;

    async fn embed(&self, texts: &[String], cancel: &CancellationToken)
    -> Result<Vec<Vec<f32>>>;
}

/// Shared HTTP client with connection pooling and keepalive.
///
/// `proxy` routes all traffic through the given URL; `timeout` bounds whole
/// requests (streams use the idle timeout instead).
pub fn http_client(proxy: Option<&str>, timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = base_client_builder();
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| GenerationError::Configuration(format!("invalid proxy URL: {e}")))?;
        builder = builder.proxy(proxy);
    }
    if let Some(timeout) = timeout {
        builder = builder.read_timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| GenerationError::Configuration(format!("failed to build HTTP client: {e}")))
}

fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .user_agent(concat!("strand/", env!("CARGO_PKG_VERSION")))
}

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

#[derive(Debug)]
pub(crate) enum SseParseAction {
    /// Continue processing, no event to emit
    Continue,
    /// Emit these events and continue
    Emit(Vec<StreamEvent>),
    /// Stop the stream with this terminal error.
    Error(StreamError),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;
    /// Closing events once the stream ends; `None` when it ended before the
    /// provider signalled completion.
    fn finish(&mut self) -> Option<Vec<StreamEvent>>;
    fn provider_name(&self) -> &'static str;
}

pub(crate) fn stream_idle_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let timeout = std::env::var("STRAND_STREAM_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
        Duration::from_secs(timeout)
    })
}

pub(crate) async fn send_event(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

async fn finish_stream<P: SseParser>(parser: &mut P, tx: &mpsc::Sender<StreamEvent>) {
    match parser.finish() {
        Some(events) => {
            for event in events {
                if !send_event(tx, event).await {
                    return;
                }
            }
        }
        None => {
            let _ = send_event(
                tx,
                StreamEvent::Error(StreamError::Network(
                    "Connection closed before stream completed".to_string(),
                )),
            )
            .await;
        }
    }
}

/// Process an SSE stream using a provider-specific parser.
///
/// Handles idle timeouts, buffer limits, UTF-8 validation, event boundaries,
/// the `[DONE]` marker and a parse-error threshold. Cancellation drops the
/// response body and returns [`GenerationError::Cancelled`].
pub(crate) async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GenerationError::Cancelled),
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };
        let Ok(next) = next else {
            let error = StreamError::Network("Stream idle timeout".to_string());
            let _ = send_event(tx, StreamEvent::Error(error)).await;
            return Ok(());
        };

        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let error = StreamError::Network(format!("Stream read failed: {e}"));
                let _ = send_event(tx, StreamEvent::Error(error)).await;
                return Ok(());
            }
        };
        buffer.extend_from_slice(&chunk);

        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_event(
                tx,
                StreamEvent::Error(StreamError::Protocol(
                    "SSE buffer exceeded maximum size (4 MiB)".to_string(),
                )),
            )
            .await;
            return Ok(());
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                let _ = send_event(
                    tx,
                    StreamEvent::Error(StreamError::Protocol(
                        "Received invalid UTF-8 from SSE stream".to_string(),
                    )),
                )
                .await;
                return Ok(());
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                finish_stream(parser, tx).await;
                return Ok(());
            }

            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => {
                    parse_errors = 0;
                    match parser.parse(&json) {
                        SseParseAction::Continue => {}
                        SseParseAction::Emit(events) => {
                            for event in events {
                                if !send_event(tx, event).await {
                                    return Ok(());
                                }
                            }
                        }
                        SseParseAction::Error(error) => {
                            let _ = send_event(tx, StreamEvent::Error(error)).await;
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        provider = parser.provider_name(),
                        "Invalid SSE JSON payload"
                    );
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        let _ = send_event(
                            tx,
                            StreamEvent::Error(StreamError::Protocol(format!(
                                "Invalid stream payload: {e}"
                            ))),
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }
    }

    // EOF: complete only if the provider already signalled a finish reason.
    finish_stream(parser, tx).await;
    Ok(())
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Send `request`, mapping non-success statuses to classified errors.
pub(crate) async fn send_checked(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<reqwest::Response> {
    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(GenerationError::Cancelled),
        response = request.send() => response?,
    };

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(GenerationError::Cancelled),
        body = read_capped_error_body(response) => body,
    };
    let message = strand_utils::redact_secrets(&extract_error_message(&body));
    tracing::debug!(status = status.as_u16(), %message, "Upstream returned error status");
    Err(GenerationError::from_status(
        status.as_u16(),
        message,
        retry_after,
    ))
}

/// Read a JSON body, honoring cancellation.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    cancel: &CancellationToken,
) -> Result<T> {
    let bytes = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(GenerationError::Cancelled),
        bytes = response.bytes() => bytes?,
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| GenerationError::Protocol(format!("invalid JSON response: {e}")))
}

/// Parse streamed or returned function-call arguments, falling back to `{}`.
pub(crate) fn parse_arguments(name: &str, raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(other) => {
            tracing::warn!(tool = name, "Function arguments are not an object: {other}");
            serde_json::Value::Object(serde_json::Map::new())
        }
        Err(e) => {
            tracing::warn!(tool = name, "Failed to parse function arguments: {e}");
            serde_json::Value::Object(serde_json::Map::new())
        }
    }
}
