//! OpenAI-compatible Chat Completions adapter.
//!
//! Translates canonical requests to `/chat/completions` bodies and normalizes
//! streamed chunks to [`StreamEvent`]s. The endpoint (base URL and key) is a
//! value passed per call so the Qwen wrapper can supply fresh credentials
//! without mutating a shared client.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use strand_types::{
    ApiKey, FinishReason, Part, Role, SamplingParams, StreamError, TokenUsage, ToolDeclaration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::interaction_log::InteractionLogger;
use crate::sse_types::openai as typed;
use crate::tool_hygiene::{clean_orphaned_tool_calls, merge_consecutive_assistant_messages};
use crate::{
    ContentGenerator, FunctionCall, GenerationError, GenerationRequest, GenerationResponse,
    Result, SseParseAction, SseParser, StreamEvent, parse_arguments, process_sse_stream,
    read_json, send_checked, stream_idle_timeout, token_estimate,
};

const DEFAULT_TEMPERATURE: f32 = 0.0;
const DEFAULT_TOP_P: f32 = 1.0;
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-v3";

/// Where a call goes and how it authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub api_key: ApiKey,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, api_key: ApiKey) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a Chat Completions request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(ChatRole::User, content)
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub(crate) fn has_content(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON-encoded arguments object
    pub arguments: String,
}

fn response_content(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Translate canonical history into Chat Completions messages, cleaned of
/// orphaned tool calls and with consecutive assistant turns merged.
#[must_use]
pub fn to_chat_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    if let Some(instruction) = request.system_instruction.as_deref()
        && !instruction.trim().is_empty()
    {
        messages.push(ChatMessage::system(instruction));
    }

    for message in &request.contents {
        match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    messages.push(ChatMessage::system(text));
                }
            }
            Role::User | Role::Tool => {
                for response in message.function_responses() {
                    messages.push(ChatMessage::tool(
                        response.id.clone(),
                        response_content(&response.response),
                    ));
                }
                let text = message.text();
                if !text.is_empty() {
                    messages.push(ChatMessage::user(text));
                }
            }
            Role::Model => {
                let text = message.text();
                let tool_calls: Vec<ToolCall> = message
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::FunctionCall(call) => Some(ToolCall::function(
                            call.id.clone(),
                            call.name.clone(),
                            call.args.to_string(),
                        )),
                        _ => None,
                    })
                    .collect();
                let content = (!text.is_empty()).then_some(text);
                if content.is_some() || !tool_calls.is_empty() {
                    messages.push(ChatMessage::assistant(content, tool_calls));
                }
            }
        }
    }

    merge_consecutive_assistant_messages(clean_orphaned_tool_calls(messages))
}

fn tool_definitions(tools: &[ToolDeclaration]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect()
}

/// Effective sampling: configured values, then request values, then defaults.
fn effective_sampling(configured: SamplingParams, request: SamplingParams) -> SamplingParams {
    configured.or(request).or(SamplingParams {
        temperature: Some(DEFAULT_TEMPERATURE),
        top_p: Some(DEFAULT_TOP_P),
        ..SamplingParams::default()
    })
}

fn build_request_body(
    request: &GenerationRequest,
    sampling: SamplingParams,
    stream: bool,
) -> Value {
    let sampling = effective_sampling(sampling, request.config);
    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(request.model));
    body.insert(
        "messages".to_string(),
        json!(to_chat_messages(request)),
    );
    if let Some(temperature) = sampling.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = sampling.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(max_tokens) = sampling.max_output_tokens {
        body.insert("max_tokens".to_string(), json!(max_tokens));
    }
    body.insert("stream".to_string(), json!(stream));
    if stream {
        body.insert(
            "stream_options".to_string(),
            json!({ "include_usage": true }),
        );
    }
    if !request.tools.is_empty() {
        body.insert(
            "tools".to_string(),
            Value::Array(tool_definitions(&request.tools)),
        );
    }
    if let Some(schema) = &request.response_schema {
        body.insert(
            "response_format".to_string(),
            json!({
                "type": "json_schema",
                "json_schema": { "name": "response", "schema": schema, "strict": false }
            }),
        );
    }
    Value::Object(body)
}

fn to_usage(usage: typed::Usage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

fn call_id_or_generated(id: &str) -> String {
    if id.trim().is_empty() {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    } else {
        id.to_string()
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates tool-call fragments by index until a finish reason arrives.
#[derive(Debug, Default)]
struct ChatStreamParser {
    tool_calls: BTreeMap<u32, PartialToolCall>,
    usage: Option<TokenUsage>,
    finish_reason: Option<FinishReason>,
    text: String,
    emitted_calls: Vec<FunctionCall>,
}

impl ChatStreamParser {
    fn flush_tool_calls(&mut self, events: &mut Vec<StreamEvent>) {
        for (_, partial) in std::mem::take(&mut self.tool_calls) {
            if partial.name.is_empty() {
                tracing::warn!(id = %partial.id, "Dropping streamed tool call without a name");
                continue;
            }
            let call = FunctionCall::new(
                call_id_or_generated(&partial.id),
                partial.name.clone(),
                parse_arguments(&partial.name, &partial.arguments),
            );
            self.emitted_calls.push(call.clone());
            events.push(StreamEvent::FunctionCall(call));
        }
    }

    /// Aggregated view of the stream for the interaction log.
    fn summary(&self) -> Value {
        json!({
            "text": self.text,
            "function_calls": self.emitted_calls,
            "finish_reason": self.finish_reason.as_ref().map(|r| format!("{r:?}")),
            "usage": self.usage,
        })
    }
}

/// An `error` object sent inside the stream. Numeric codes in the HTTP
/// error range are treated as a status.
fn upstream_error(error: typed::ErrorInfo) -> StreamError {
    let status = error
        .code
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .filter(|code| (400..600).contains(code));
    let code = error.code.as_ref().and_then(Value::as_str).map(str::to_string);
    StreamError::Upstream {
        status,
        code,
        message: error
            .message
            .unwrap_or_else(|| "Unknown stream error".to_string()),
    }
}

impl SseParser for ChatStreamParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let chunk: typed::ChatChunk = match serde_json::from_value(json.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("Failed to parse chat completion chunk: {e}");
                return SseParseAction::Error(StreamError::Protocol(format!(
                    "Invalid chat completion chunk: {e}"
                )));
            }
        };

        if let Some(error) = chunk.error {
            return SseParseAction::Error(upstream_error(error));
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(to_usage(usage));
        }

        let mut events = Vec::new();
        for choice in chunk.choices.unwrap_or_default() {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content
                    && !content.is_empty()
                {
                    self.text.push_str(&content);
                    events.push(StreamEvent::TextDelta(content));
                }
                for fragment in delta.tool_calls.unwrap_or_default() {
                    let entry = self.tool_calls.entry(fragment.index).or_default();
                    if let Some(id) = fragment.id
                        && !id.is_empty()
                    {
                        entry.id = id;
                    }
                    if let Some(function) = fragment.function {
                        if let Some(name) = function.name
                            && !name.is_empty()
                        {
                            entry.name = name;
                        }
                        if let Some(arguments) = function.arguments {
                            entry.arguments.push_str(&arguments);
                        }
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.flush_tool_calls(&mut events);
                self.finish_reason = Some(FinishReason::from_openai(&reason));
            }
        }

        if events.is_empty() {
            SseParseAction::Continue
        } else {
            SseParseAction::Emit(events)
        }
    }

    fn finish(&mut self) -> Option<Vec<StreamEvent>> {
        let reason = self.finish_reason.clone()?;
        let mut events = Vec::new();
        if let Some(usage) = self.usage {
            events.push(StreamEvent::Usage(usage));
        }
        events.push(StreamEvent::Finished(reason));
        Some(events)
    }

    fn provider_name(&self) -> &'static str {
        "OpenAI-compatible"
    }
}

fn parse_completion(completion: typed::ChatCompletion) -> Result<GenerationResponse> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GenerationError::Protocol("response contained no choices".to_string()))?;

    let function_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            let args = parse_arguments(&call.function.name, &call.function.arguments);
            FunctionCall::new(call_id_or_generated(&call.id), call.function.name, args)
        })
        .collect();

    Ok(GenerationResponse {
        text: choice.message.content.unwrap_or_default(),
        function_calls,
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_openai)
            .unwrap_or_default(),
        usage: completion.usage.map(to_usage),
    })
}

/// Chat Completions client.
///
/// Without a configured endpoint only the `*_at` methods are usable; the
/// trait methods report a configuration error.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    http: reqwest::Client,
    endpoint: Option<Endpoint>,
    sampling: SamplingParams,
    embedding_model: String,
    logger: Option<InteractionLogger>,
}

impl OpenAiGenerator {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: None,
            sampling: SamplingParams::default(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            logger: None,
        }
    }

    #[must_use]
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Configured sampling values; these take precedence over request values.
    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: InteractionLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    fn endpoint(&self) -> Result<&Endpoint> {
        self.endpoint.as_ref().ok_or_else(|| {
            GenerationError::Configuration("no OpenAI-compatible endpoint configured".to_string())
        })
    }

    fn post(&self, endpoint: &Endpoint, path: &str, body: &Value) -> reqwest::RequestBuilder {
        self.http
            .post(endpoint.url(path))
            .bearer_auth(endpoint.api_key.expose_secret())
            .header("content-type", "application/json")
            .json(body)
    }

    fn log(&self, request: &Value, response: Result<&Value, &GenerationError>) {
        if let Some(logger) = &self.logger {
            logger.log(request, response);
        }
    }

    pub async fn generate_at(
        &self,
        endpoint: &Endpoint,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse> {
        let body = build_request_body(request, self.sampling, false);
        let outcome = async {
            let response =
                send_checked(self.post(endpoint, "chat/completions", &body), cancel).await?;
            let raw: Value = read_json(response, cancel).await?;
            let completion: typed::ChatCompletion = serde_json::from_value(raw.clone())
                .map_err(|e| GenerationError::Protocol(format!("invalid chat completion: {e}")))?;
            Ok::<_, GenerationError>((raw, completion))
        }
        .await;

        match outcome {
            Ok((raw, completion)) => {
                self.log(&body, Ok(&raw));
                parse_completion(completion)
            }
            Err(e) => {
                self.log(&body, Err(&e));
                Err(e)
            }
        }
    }

    pub async fn stream_at(
        &self,
        endpoint: &Endpoint,
        request: &GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let body = build_request_body(request, self.sampling, true);
        let response =
            match send_checked(self.post(endpoint, "chat/completions", &body), cancel).await {
                Ok(response) => response,
                Err(e) => {
                    self.log(&body, Err(&e));
                    return Err(e);
                }
            };

        let mut parser = ChatStreamParser::default();
        let result =
            process_sse_stream(response, &mut parser, &tx, stream_idle_timeout(), cancel).await;
        match &result {
            Ok(()) => self.log(&body, Ok(&parser.summary())),
            Err(e) => self.log(&body, Err(e)),
        }
        result
    }

    pub async fn embed_at(
        &self,
        endpoint: &Endpoint,
        model: &str,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": model, "input": texts });
        let response = send_checked(self.post(endpoint, "embeddings", &body), cancel).await?;
        let parsed: typed::EmbeddingsResponse = read_json(response, cancel).await?;

        let mut data = parsed.data;
        if data.len() != texts.len() {
            return Err(GenerationError::Protocol(format!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                data.len()
            )));
        }
        data.sort_by_key(|item| item.index);
        data.into_iter()
            .enumerate()
            .map(|(index, item)| {
                if item.embedding.is_empty() {
                    Err(GenerationError::Protocol(format!(
                        "empty embedding at index {index}"
                    )))
                } else {
                    Ok(item.embedding)
                }
            })
            .collect()
    }
}

/// Approximate token count of the serialized request.
pub(crate) fn estimate_request_tokens(request: &GenerationRequest, sampling: SamplingParams) -> u32 {
    let body = build_request_body(request, sampling, false);
    token_estimate::count_tokens(&body.to_string())
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse> {
        self.generate_at(self.endpoint()?, request, cancel).await
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.stream_at(self.endpoint()?, request, tx, cancel).await
    }

    async fn count_tokens(
        &self,
        request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<u32> {
        Ok(estimate_request_tokens(request, self.sampling))
    }

    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        self.embed_at(self.endpoint()?, &self.embedding_model, texts, cancel)
            .await
    }
}
