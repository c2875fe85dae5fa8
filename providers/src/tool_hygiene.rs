//! Referential integrity for Chat Completions tool messages.
//!
//! OpenAI-compatible servers reject a `tool` message whose `tool_call_id` was
//! never declared, and an assistant `tool_calls` entry that never received a
//! response. Histories can end up that way after cancellation or compaction,
//! so every outbound request goes through [`clean_orphaned_tool_calls`].

use std::collections::HashSet;

use crate::openai::{ChatMessage, ChatRole, ToolCall};

/// Remove tool responses without a preceding call, tool calls without a later
/// response, and assistant messages left empty. Idempotent.
#[must_use]
pub fn clean_orphaned_tool_calls(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut declared: HashSet<String> = HashSet::new();
    let mut answered: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            ChatRole::Assistant => {
                declared.extend(message.tool_calls.iter().map(|call| call.id.clone()));
                kept.push(message);
            }
            ChatRole::Tool => match message.tool_call_id.as_deref() {
                Some(id) if declared.contains(id) => {
                    answered.insert(id.to_string());
                    kept.push(message);
                }
                id => {
                    tracing::debug!(tool_call_id = ?id, "Dropping orphaned tool response");
                }
            },
            ChatRole::System | ChatRole::User => kept.push(message),
        }
    }

    kept.into_iter()
        .filter_map(|mut message| {
            if message.role != ChatRole::Assistant {
                return Some(message);
            }
            let before = message.tool_calls.len();
            message.tool_calls.retain(|call| answered.contains(&call.id));
            if message.tool_calls.len() != before {
                tracing::debug!(
                    removed = before - message.tool_calls.len(),
                    "Stripped unanswered tool calls"
                );
            }
            (message.has_content() || !message.tool_calls.is_empty()).then_some(message)
        })
        .collect()
}

/// Merge runs of assistant messages. Text is concatenated in order; tool calls
/// are unioned, keeping the first occurrence of each id.
#[must_use]
pub fn merge_consecutive_assistant_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        match merged.last_mut() {
            Some(previous)
                if previous.role == ChatRole::Assistant
                    && message.role == ChatRole::Assistant =>
            {
                if let Some(text) = message.content.filter(|text| !text.is_empty()) {
                    match previous.content.as_mut() {
                        Some(existing) => existing.push_str(&text),
                        None => previous.content = Some(text),
                    }
                }
                append_unique_calls(&mut previous.tool_calls, message.tool_calls);
            }
            _ => merged.push(message),
        }
    }

    merged
}

fn append_unique_calls(target: &mut Vec<ToolCall>, incoming: Vec<ToolCall>) {
    let mut seen: HashSet<String> = target.iter().map(|call| call.id.clone()).collect();
    for call in incoming {
        if seen.insert(call.id.clone()) {
            target.push(call);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall::function(id, "tool", "{}")
    }

    fn sample() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("sys"),
            ChatMessage::tool("ghost", "early response"),
            ChatMessage::user("go"),
            ChatMessage::assistant(None, vec![call("a"), call("b")]),
            ChatMessage::tool("a", "done"),
            ChatMessage::assistant(None, vec![call("c")]),
            ChatMessage::user("next"),
        ]
    }

    #[test]
    fn removes_orphans_in_both_directions() {
        let cleaned = clean_orphaned_tool_calls(sample());
        let roles: Vec<_> = cleaned.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                ChatRole::System,
                ChatRole::User,
                ChatRole::Assistant,
                ChatRole::Tool,
                ChatRole::User
            ]
        );
        let ids: Vec<_> = cleaned[2].tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn response_before_declaration_is_orphaned() {
        let messages = vec![
            ChatMessage::tool("x", "out of order"),
            ChatMessage::assistant(Some("calling".into()), vec![call("x")]),
        ];
        let cleaned = clean_orphaned_tool_calls(messages);
        assert_eq!(cleaned.len(), 1);
        assert!(cleaned[0].tool_calls.is_empty());
        assert_eq!(cleaned[0].content.as_deref(), Some("calling"));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let once = clean_orphaned_tool_calls(sample());
        let twice = clean_orphaned_tool_calls(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn every_kept_reference_resolves() {
        let cleaned = clean_orphaned_tool_calls(sample());
        let declared: HashSet<_> = cleaned
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
            .collect();
        let answered: HashSet<_> = cleaned
            .iter()
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        assert_eq!(declared, answered);
    }

    #[test]
    fn merges_consecutive_assistants() {
        let merged = merge_consecutive_assistant_messages(vec![
            ChatMessage::user("q"),
            ChatMessage::assistant(Some("Hello".into()), vec![call("1")]),
            ChatMessage::assistant(Some(" world".into()), vec![call("1"), call("2")]),
            ChatMessage::assistant(None, vec![call("3")]),
            ChatMessage::tool("1", "r"),
            ChatMessage::assistant(Some("again".into()), Vec::new()),
        ]);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[1].content.as_deref(), Some("Hello world"));
        let ids: Vec<_> = merged[1].tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(merged[3].content.as_deref(), Some("again"));
    }

    #[test]
    fn merge_fills_missing_content() {
        let merged = merge_consecutive_assistant_messages(vec![
            ChatMessage::assistant(None, vec![call("1")]),
            ChatMessage::assistant(Some("text".into()), Vec::new()),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content.as_deref(), Some("text"));
    }
}
