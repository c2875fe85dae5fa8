//! Typed wire structures for provider responses.
//!
//! Parse errors happen at the serde boundary, not scattered through the
//! adapters. Every field a provider may omit or send as `null` is optional.

pub mod openai {
    use serde::Deserialize;

    /// One `chat.completion.chunk` from a streaming Chat Completions call.
    #[derive(Debug, Deserialize, Default)]
    pub struct ChatChunk {
        #[serde(default)]
        pub choices: Option<Vec<ChunkChoice>>,
        pub usage: Option<Usage>,
        pub error: Option<ErrorInfo>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ChunkChoice {
        #[serde(default)]
        pub index: u32,
        #[serde(default)]
        pub delta: Option<Delta>,
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct Delta {
        pub content: Option<String>,
        #[serde(default)]
        pub tool_calls: Option<Vec<ToolCallDelta>>,
    }

    /// A fragment of a streamed tool call. Fragments sharing an `index`
    /// belong to the same call; `arguments` arrive as string pieces.
    #[derive(Debug, Deserialize)]
    pub struct ToolCallDelta {
        #[serde(default)]
        pub index: u32,
        pub id: Option<String>,
        pub function: Option<FunctionDelta>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct FunctionDelta {
        pub name: Option<String>,
        pub arguments: Option<String>,
    }

    #[derive(Debug, Deserialize, Default, Clone, Copy)]
    pub struct Usage {
        #[serde(default)]
        pub prompt_tokens: u32,
        #[serde(default)]
        pub completion_tokens: u32,
        #[serde(default)]
        pub total_tokens: u32,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorInfo {
        pub message: Option<String>,
        /// A string such as `insufficient_quota`, or an HTTP-like number.
        pub code: Option<serde_json::Value>,
    }

    /// Non-streaming `chat.completion` body.
    #[derive(Debug, Deserialize)]
    pub struct ChatCompletion {
        #[serde(default)]
        pub choices: Vec<CompletionChoice>,
        pub usage: Option<Usage>,
    }

    #[derive(Debug, Deserialize)]
    pub struct CompletionChoice {
        pub message: CompletionMessage,
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct CompletionMessage {
        pub content: Option<String>,
        #[serde(default)]
        pub tool_calls: Option<Vec<CompletionToolCall>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct CompletionToolCall {
        #[serde(default)]
        pub id: String,
        pub function: CompletionFunction,
    }

    #[derive(Debug, Deserialize)]
    pub struct CompletionFunction {
        pub name: String,
        #[serde(default)]
        pub arguments: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct EmbeddingsResponse {
        #[serde(default)]
        pub data: Vec<EmbeddingData>,
    }

    #[derive(Debug, Deserialize)]
    pub struct EmbeddingData {
        #[serde(default)]
        pub embedding: Vec<f32>,
        #[serde(default)]
        pub index: usize,
    }

}

pub mod gemini {
    use serde::Deserialize;

    /// Token usage data returned by Gemini API.
    #[derive(Debug, Deserialize, Default, Clone, Copy)]
    #[serde(rename_all = "camelCase")]
    pub struct UsageMetadata {
        #[serde(default)]
        pub prompt_token_count: u32,
        #[serde(default)]
        pub candidates_token_count: u32,
        #[serde(default)]
        pub total_token_count: u32,
    }

    /// A `generateContent` response, or one SSE chunk of a streamed one.
    ///
    /// Gemini doesn't use event types; each chunk is a complete response
    /// object with candidates.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Response {
        pub candidates: Option<Vec<Candidate>>,
        pub error: Option<ErrorInfo>,
        pub usage_metadata: Option<UsageMetadata>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Candidate {
        pub content: Option<Content>,
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Content {
        pub parts: Option<Vec<Part>>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Part {
        pub text: Option<String>,
        /// Thinking content; not surfaced as output text
        #[serde(default)]
        pub thought: bool,
        pub function_call: Option<FunctionCall>,
    }

    #[derive(Debug, Deserialize)]
    pub struct FunctionCall {
        pub id: Option<String>,
        pub name: Option<String>,
        pub args: Option<serde_json::Value>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorInfo {
        pub message: Option<String>,
        pub code: Option<i32>,
        /// Canonical status name, e.g. `RESOURCE_EXHAUSTED`.
        pub status: Option<String>,
    }

    impl ErrorInfo {
        #[must_use]
        pub fn message_or_default(&self) -> &str {
            self.message.as_deref().unwrap_or("Unknown error")
        }
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CountTokensResponse {
        #[serde(default)]
        pub total_tokens: u32,
    }

    #[derive(Debug, Deserialize)]
    pub struct BatchEmbedResponse {
        #[serde(default)]
        pub embeddings: Vec<Embedding>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Embedding {
        #[serde(default)]
        pub values: Vec<f32>,
    }

}
