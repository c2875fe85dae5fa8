//! Message-based error classifiers.
//!
//! Upstream services signal quota, throttling and credential problems with a
//! mix of status codes and free-form messages. These predicates look at both
//! and are shared by the retry policy and the Qwen token wrapper.

/// Qwen/DashScope quota exhaustion. Retrying does not help.
#[must_use]
pub fn is_qwen_quota_exceeded_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("insufficient_quota")
        || lower.contains("free allocated quota exceeded")
        || (lower.contains("quota") && lower.contains("exceeded"))
}

/// Qwen/DashScope request throttling. Retrying after a delay helps.
#[must_use]
pub fn is_qwen_throttling_error(status: Option<u16>, message: &str) -> bool {
    let lower = message.to_lowercase();
    let throttling_message = lower.contains("throttling")
        || lower.contains("requests throttling triggered")
        || lower.contains("rate limit")
        || lower.contains("too many requests");
    (status == Some(429) && throttling_message) || lower.contains("throttling")
}

/// Gemini Pro per-model quota, e.g.
/// `Quota exceeded for quota metric 'Gemini 2.5 Pro Requests'`.
#[must_use]
pub fn is_pro_quota_exceeded_error(message: &str) -> bool {
    message.contains("Quota exceeded for quota metric 'Gemini") && message.contains("Pro Requests'")
}

#[must_use]
pub fn is_generic_quota_exceeded_error(message: &str) -> bool {
    message.contains("Quota exceeded for quota metric")
}

/// Any of the quota predicates above.
#[must_use]
pub fn is_quota_exceeded(message: &str) -> bool {
    is_qwen_quota_exceeded_error(message)
        || is_pro_quota_exceeded_error(message)
        || is_generic_quota_exceeded_error(message)
}

/// Credential rejection: status 400/401/403 or a message that names an
/// authentication problem.
#[must_use]
pub fn is_auth_error(status: Option<u16>, message: &str) -> bool {
    if matches!(status, Some(400 | 401 | 403)) {
        return true;
    }
    let lower = message.to_lowercase();
    const NEEDLES: &[&str] = &[
        "unauthorized",
        "forbidden",
        "invalid api key",
        "invalid access token",
        "token expired",
        "authentication",
        "access denied",
    ];
    NEEDLES.iter().any(|needle| lower.contains(needle))
        || (lower.contains("token") && lower.contains("expired"))
}
