//! Model context-window limits with prefix matching.

/// Limit used when no prefix matches.
pub const DEFAULT_TOKEN_LIMIT: u32 = 1_048_576;

/// Where a resolved limit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelLimitSource {
    /// Matched a known prefix (the matched prefix).
    Prefix(&'static str),
    /// Fell back to [`DEFAULT_TOKEN_LIMIT`].
    DefaultFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTokenLimit {
    pub limit: u32,
    pub source: ModelLimitSource,
}

/// Known model prefixes and their context windows.
///
/// Ordered by specificity: the first matching prefix wins.
const KNOWN_MODELS: &[(&str, u32)] = &[
    ("gemini-1.5-pro", 2_097_152),
    ("gemini-1.5-flash", 1_048_576),
    ("gemini-2.5-pro", 1_048_576),
    ("gemini-2.5-flash", 1_048_576),
    ("gemini-2.0-flash", 1_048_576),
    ("gemini-2", 1_048_576),
    ("qwen3-coder-plus", 1_048_576),
    ("qwen3-coder-flash", 1_048_576),
    ("qwen", 131_072),
    ("gpt-4o", 128_000),
];

#[must_use]
pub fn resolve_token_limit(model: &str) -> ResolvedTokenLimit {
    let model = model.strip_prefix("models/").unwrap_or(model);
    KNOWN_MODELS
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map_or(
            ResolvedTokenLimit {
                limit: DEFAULT_TOKEN_LIMIT,
                source: ModelLimitSource::DefaultFallback,
            },
            |(prefix, limit)| ResolvedTokenLimit {
                limit: *limit,
                source: ModelLimitSource::Prefix(prefix),
            },
        )
}

/// Context window of `model` in tokens.
#[must_use]
pub fn token_limit(model: &str) -> u32 {
    resolve_token_limit(model).limit
}
