//! Events emitted by a [`Session`](crate::Session) while it handles a message.

use strand_types::{CompressionResult, FinishReason, FunctionCall, TokenUsage};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Streamed model text.
    Content(String),
    /// A complete tool call the caller is expected to execute.
    FunctionCall(FunctionCall),
    Usage(TokenUsage),
    /// History was compacted before dispatch.
    ChatCompressed(CompressionResult),
    /// Persistent rate limiting moved the session to another model.
    ModelSwitched { from: String, to: String },
    /// The configured turn budget is spent. Terminal, not an error.
    MaxSessionTurns,
    /// The would-be request is larger than the session token limit.
    SessionTokenLimitExceeded {
        current: u32,
        limit: u32,
        message: String,
    },
    /// The model is repeating itself; the turn was stopped.
    LoopDetected,
    /// One model turn completed.
    Finished(FinishReason),
    /// Terminal failure. `stage` names where it originated (`auth`, `quota`,
    /// `network`, `protocol`, `generation`, ...).
    Error { stage: String, message: String },
}

impl SessionEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::MaxSessionTurns
                | Self::SessionTokenLimitExceeded { .. }
                | Self::LoopDetected
                | Self::Error { .. }
        )
    }

    pub(crate) fn error(stage: &str, message: impl Into<String>) -> Self {
        Self::Error {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

#[must_use]
pub fn session_token_limit_message(current: u32, limit: u32) -> String {
    format!(
        "Session token limit exceeded: {current} tokens > {limit} limit. \
         Please start a new session or increase session_token_limit in your config."
    )
}
