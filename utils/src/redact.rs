//! Secret redaction for log lines, error messages, and interaction records.
//!
//! Pattern-based: bearer tokens, provider API keys (`sk-*`, `AIza*`), and the
//! OAuth token fields that appear in device-flow and refresh payloads.

use std::sync::LazyLock;

use regex::Regex;

const REDACTED: &str = "[REDACTED]";

/// JSON object keys whose string values are always secret.
const SECRET_KEYS: [&str; 6] = [
    "access_token",
    "refresh_token",
    "device_code",
    "code_verifier",
    "api_key",
    "authorization",
];

struct PatternRedactor {
    patterns: Vec<(Regex, &'static str)>,
}

impl PatternRedactor {
    fn new() -> Self {
        let sources: [(&str, &'static str); 4] = [
            (r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]+", "${1}[REDACTED]"),
            (
                r#"(?i)("(?:access_token|refresh_token|device_code|code_verifier|api_key)"\s*:\s*")[^"]*(")"#,
                "${1}[REDACTED]${2}",
            ),
            (r"\bsk-[A-Za-z0-9_-]{8,}", "sk-***"),
            (r"\bAIza[0-9A-Za-z_-]{20,}", "AIza***"),
        ];
        let patterns = sources
            .into_iter()
            .filter_map(|(source, replacement)| match Regex::new(source) {
                Ok(regex) => Some((regex, replacement)),
                Err(e) => {
                    tracing::warn!("Skipping invalid redaction pattern: {e}");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        for (regex, replacement) in &self.patterns {
            if regex.is_match(&output) {
                output = regex.replace_all(&output, *replacement).into_owned();
            }
        }
        output
    }
}

static PATTERN_REDACTOR: LazyLock<PatternRedactor> = LazyLock::new(PatternRedactor::new);

/// Redact bearer tokens, API keys, and OAuth token fields from free text.
#[must_use]
pub fn redact_secrets(raw: &str) -> String {
    PATTERN_REDACTOR.redact(raw)
}

/// True when a JSON field named `key` always carries a secret value.
#[must_use]
pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEYS.iter().any(|secret| key.eq_ignore_ascii_case(secret))
}

/// Recursively mask secret-named fields in a JSON document, then redact
/// secrets embedded in remaining string values.
pub fn redact_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if is_secret_key(key) && entry.is_string() {
                    *entry = serde_json::Value::String(REDACTED.to_string());
                } else {
                    redact_json(entry);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_json),
        serde_json::Value::String(text) => {
            let redacted = redact_secrets(text);
            if redacted != *text {
                *text = redacted;
            }
        }
        _ => {}
    }
}
