//! Native Gemini adapter.
//!
//! The canonical message shape is the Gemini shape, so requests are mostly a
//! pass-through: `contents[{role, parts}]`, `systemInstruction`,
//! `generationConfig` and `tools[{functionDeclarations}]`.

use async_trait::async_trait;
use serde_json::{Value, json};
use strand_types::{ApiKey, FinishReason, Role, StreamError, TokenUsage, ToolDeclaration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::sse_types::gemini as typed;
use crate::{
    ContentGenerator, FunctionCall, GenerationError, GenerationRequest, GenerationResponse,
    Message, Result, SseParseAction, SseParser, StreamEvent, process_sse_stream, read_json,
    send_checked, stream_idle_timeout,
};

pub const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";

fn remove_additional_properties(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("additionalProperties");
            for value in map.values_mut() {
                remove_additional_properties(value);
            }
        }
        Value::Array(values) => {
            for value in values {
                remove_additional_properties(value);
            }
        }
        _ => {}
    }
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::Model => "model",
        Role::System | Role::User | Role::Tool => "user",
    }
}

fn content_entry(message: &Message) -> Value {
    let parts: Vec<Value> = message
        .parts
        .iter()
        .map(|part| serde_json::to_value(part).unwrap_or_else(|_| json!({ "text": "" })))
        .collect();
    json!({ "role": gemini_role(message.role), "parts": parts })
}

fn function_declarations(tools: &[ToolDeclaration]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut parameters = tool.parameters.clone();
            remove_additional_properties(&mut parameters);
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": parameters,
            })
        })
        .collect()
}

/// Build the request body for `generateContent` and `countTokens`.
fn build_request_body(request: &GenerationRequest) -> Value {
    let contents: Vec<Value> = request
        .contents
        .iter()
        .filter(|message| !message.parts.is_empty())
        .map(content_entry)
        .collect();

    let mut body = serde_json::Map::new();
    body.insert("contents".to_string(), Value::Array(contents));

    if let Some(instruction) = request.system_instruction.as_deref()
        && !instruction.trim().is_empty()
    {
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": instruction }] }),
        );
    }

    let mut generation_config = serde_json::Map::new();
    let config = request.config;
    if let Some(temperature) = config.temperature {
        generation_config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = config.top_p {
        generation_config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(top_k) = config.top_k {
        generation_config.insert("topK".to_string(), json!(top_k));
    }
    if let Some(max) = config.max_output_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max));
    }
    if let Some(schema) = &request.response_schema {
        let mut schema = schema.clone();
        remove_additional_properties(&mut schema);
        generation_config.insert("responseMimeType".to_string(), json!("application/json"));
        generation_config.insert("responseSchema".to_string(), schema);
    }
    if !generation_config.is_empty() {
        body.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }

    if !request.tools.is_empty() {
        body.insert(
            "tools".to_string(),
            json!([{ "functionDeclarations": function_declarations(&request.tools) }]),
        );
    }

    Value::Object(body)
}

fn to_usage(usage: typed::UsageMetadata) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
    }
}

fn to_function_call(call: typed::FunctionCall) -> Option<FunctionCall> {
    let name = call.name.unwrap_or_default();
    if name.is_empty() {
        tracing::warn!("Gemini function call with empty name, skipping");
        return None;
    }
    // Gemini does not always provide an id; the history needs one to pair
    // the response with the call.
    let id = call
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
    Some(FunctionCall::new(id, name, call.args.unwrap_or_else(|| json!({}))))
}

/// Parser state for Gemini SSE streams. Each chunk is a full response object.
#[derive(Default)]
struct GeminiParser {
    usage: Option<TokenUsage>,
    finish_reason: Option<FinishReason>,
}

impl SseParser for GeminiParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let response: typed::Response = match serde_json::from_value(json.clone()) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%e, "Failed to parse Gemini SSE event");
                return SseParseAction::Error(StreamError::Protocol(format!(
                    "Invalid Gemini stream event: {e}"
                )));
            }
        };

        if let Some(error) = response.error {
            return SseParseAction::Error(StreamError::Upstream {
                status: error.code.and_then(|code| u16::try_from(code).ok()),
                code: error.status.clone(),
                message: error.message_or_default().to_string(),
            });
        }

        if let Some(usage) = response.usage_metadata {
            self.usage = Some(to_usage(usage));
        }

        let mut events = Vec::new();
        for candidate in response.candidates.unwrap_or_default() {
            // Content first so the final chunk's text is kept.
            if let Some(content) = candidate.content
                && let Some(parts) = content.parts
            {
                for part in parts {
                    if let Some(text) = part.text
                        && !part.thought
                        && !text.is_empty()
                    {
                        events.push(StreamEvent::TextDelta(text));
                    }
                    if let Some(call) = part.function_call.and_then(to_function_call) {
                        events.push(StreamEvent::FunctionCall(call));
                    }
                }
            }
            if let Some(reason) = candidate.finish_reason {
                self.finish_reason = Some(FinishReason::from_gemini(&reason));
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
        "Gemini"
    }
}

fn parse_response(response: typed::Response) -> Result<GenerationResponse> {
    if let Some(error) = response.error {
        return Err(GenerationError::Protocol(
            error.message_or_default().to_string(),
        ));
    }
    let candidate = response
        .candidates
        .and_then(|candidates| candidates.into_iter().next())
        .ok_or_else(|| GenerationError::Protocol("response contained no candidates".to_string()))?;

    let mut text = String::new();
    let mut function_calls = Vec::new();
    for part in candidate
        .content
        .and_then(|content| content.parts)
        .unwrap_or_default()
    {
        if let Some(chunk) = part.text
            && !part.thought
        {
            text.push_str(&chunk);
        }
        if let Some(call) = part.function_call.and_then(to_function_call) {
            function_calls.push(call);
        }
    }

    let finish_reason = match candidate.finish_reason.as_deref() {
        Some(reason) => FinishReason::from_gemini(reason),
        None if !function_calls.is_empty() => FinishReason::ToolCalls,
        None => FinishReason::Stop,
    };

    Ok(GenerationResponse {
        text,
        function_calls,
        finish_reason,
        usage: response.usage_metadata.map(to_usage),
    })
}

/// Native generator authenticated with an API key.
#[derive(Debug, Clone)]
pub struct GeminiGenerator {
    http: reqwest::Client,
    base_url: String,
    api_key: ApiKey,
    embedding_model: String,
}

impl GeminiGenerator {
    #[must_use]
    pub fn new(http: reqwest::Client, api_key: ApiKey) -> Self {
        Self {
            http,
            base_url: API_BASE.to_string(),
            api_key,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/models/{model}:{method}", self.base_url)
    }

    fn post(&self, url: String, body: &Value) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .header("content-type", "application/json")
            .json(body)
    }
}

#[async_trait]
impl ContentGenerator for GeminiGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse> {
        let body = build_request_body(request);
        let url = self.model_url(&request.model, "generateContent");
        let response = send_checked(self.post(url, &body), cancel).await?;
        let parsed: typed::Response = read_json(response, cancel).await?;
        parse_response(parsed)
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let body = build_request_body(request);
        let url = format!(
            "{}?alt=sse",
            self.model_url(&request.model, "streamGenerateContent")
        );
        let response = send_checked(self.post(url, &body), cancel).await?;
        let mut parser = GeminiParser::default();
        process_sse_stream(response, &mut parser, &tx, stream_idle_timeout(), cancel).await
    }

    async fn count_tokens(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let body = build_request_body(request);
        let body = json!({ "contents": body["contents"] });
        let url = self.model_url(&request.model, "countTokens");
        let response = send_checked(self.post(url, &body), cancel).await?;
        let parsed: typed::CountTokensResponse = read_json(response, cancel).await?;
        Ok(parsed.total_tokens)
    }

    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = format!("models/{}", self.embedding_model);
        let requests: Vec<Value> = texts
            .iter()
            .map(|text| json!({ "model": model, "content": { "parts": [{ "text": text }] } }))
            .collect();
        let body = json!({ "requests": requests });
        let url = self.model_url(&self.embedding_model, "batchEmbedContents");
        let response = send_checked(self.post(url, &body), cancel).await?;
        let parsed: typed::BatchEmbedResponse = read_json(response, cancel).await?;

        if parsed.embeddings.len() != texts.len() {
            return Err(GenerationError::Protocol(format!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        parsed
            .embeddings
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| {
                if embedding.values.is_empty() {
                    Err(GenerationError::Protocol(format!(
                        "empty embedding at index {index}"
                    )))
                } else {
                    Ok(embedding.values)
                }
            })
            .collect()
    }
}
