//! Decides whether the model should keep talking after a finished turn.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use strand_providers::ContentGenerator;
use strand_types::{GenerationRequest, Message, Role};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextSpeaker {
    User,
    Model,
}

#[derive(Debug, Deserialize)]
struct NextSpeakerResponse {
    #[serde(default)]
    reasoning: String,
    next_speaker: NextSpeaker,
}

#[async_trait]
pub trait NextSpeakerChecker: Send + Sync {
    /// `None` means "no opinion"; the session then waits for the user.
    async fn check(
        &self,
        history: &[Message],
        model: &str,
        cancel: &CancellationToken,
    ) -> Option<NextSpeaker>;
}

const CHECK_PROMPT: &str = r#"Look only at your immediately preceding response and decide who should speak next.

1. If that response states that you are about to do something next ("Next, I will...", "Now I'll...", "Moving on to..."), or it ends abruptly mid-thought, the model speaks next.
2. If that response ends with a direct question for the user, the user speaks next.
3. If that response completed a thought or a task and is waiting for input, the user speaks next.

Answer with JSON matching the provided schema: a short "reasoning" and "next_speaker" set to "user" or "model"."#;

fn response_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "reasoning": {
                "type": "string",
                "description": "Brief justification for the choice of next speaker."
            },
            "next_speaker": {
                "type": "string",
                "enum": ["user", "model"],
                "description": "Who should speak next."
            }
        },
        "required": ["reasoning", "next_speaker"]
    })
}

/// Pull the JSON object out of a reply that may be wrapped in a code fence.
fn parse_reply(text: &str) -> Option<NextSpeakerResponse> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).ok()
}

/// Asks the active generator, using a JSON response schema.
pub struct ModelNextSpeakerChecker {
    generator: Arc<dyn ContentGenerator>,
}

impl ModelNextSpeakerChecker {
    #[must_use]
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl NextSpeakerChecker for ModelNextSpeakerChecker {
    async fn check(
        &self,
        history: &[Message],
        model: &str,
        cancel: &CancellationToken,
    ) -> Option<NextSpeaker> {
        let last = history.last()?;
        if last.role != Role::Model {
            return None;
        }
        if last.function_calls().next().is_none() && last.text().trim().is_empty() {
            return Some(NextSpeaker::Model);
        }

        let mut contents = history.to_vec();
        contents.push(Message::user_text(CHECK_PROMPT));
        let request = GenerationRequest::new(model, contents).with_response_schema(response_schema());

        let response = match self.generator.generate(&request, cancel).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Next speaker check failed: {e}");
                return None;
            }
        };
        let parsed = parse_reply(&response.text)?;
        tracing::debug!(
            next_speaker = ?parsed.next_speaker,
            reasoning = %parsed.reasoning,
            "Next speaker check"
        );
        Some(parsed.next_speaker)
    }
}
