//! Canonical generation requests, responses, and streaming events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::{FunctionCall, Message};

/// A tool the model may call, described by a JSON Schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_output_tokens: Option<u32>,
}

impl SamplingParams {
    /// Fill unset fields from `fallback`.
    #[must_use]
    pub fn or(self, fallback: SamplingParams) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature.or(fallback.temperature),
            top_p: self.top_p.or(fallback.top_p),
            top_k: self.top_k.or(fallback.top_k),
            max_output_tokens: self.max_output_tokens.or(fallback.max_output_tokens),
        }
    }
}

/// A single model call, independent of any wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub contents: Vec<Message>,
    pub system_instruction: Option<String>,
    pub tools: Vec<ToolDeclaration>,
    pub config: SamplingParams,
    /// JSON Schema constraining a JSON response body.
    pub response_schema: Option<Value>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, contents: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            contents,
            system_instruction: None,
            tools: Vec::new(),
            config: SamplingParams::default(),
            response_schema: None,
        }
    }

    #[must_use]
    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDeclaration>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SamplingParams) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FinishReason {
    #[default]
    Stop,
    MaxTokens,
    Safety,
    ToolCalls,
    Other(String),
}

impl FinishReason {
    /// Map an OpenAI-style `finish_reason` string.
    #[must_use]
    pub fn from_openai(value: &str) -> Self {
        match value {
            "stop" => Self::Stop,
            "length" => Self::MaxTokens,
            "content_filter" => Self::Safety,
            "tool_calls" | "function_call" => Self::ToolCalls,
            other => Self::Other(other.to_string()),
        }
    }

    /// Map a Gemini-style `finishReason` string.
    #[must_use]
    pub fn from_gemini(value: &str) -> Self {
        match value {
            "STOP" => Self::Stop,
            "MAX_TOKENS" => Self::MaxTokens,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => Self::Safety,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationResponse {
    pub text: String,
    pub function_calls: Vec<FunctionCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<TokenUsage>,
}

/// Normalized streaming chunk emitted by every adapter.
///
/// `FunctionCall` is only ever emitted once the call's arguments are complete.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    FunctionCall(FunctionCall),
    Usage(TokenUsage),
    Finished(FinishReason),
    /// Stream terminated with an error after it had started.
    Error(StreamError),
}

/// Why a stream ended after it had started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Transport failure, idle timeout or premature close.
    #[error("{0}")]
    Network(String),
    /// A payload that could not be decoded.
    #[error("{0}")]
    Protocol(String),
    /// Error object sent by the provider inside the stream.
    #[error("{message}")]
    Upstream {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },
}

/// Outcome of one history compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionResult {
    pub original_token_count: u32,
    pub new_token_count: u32,
}
