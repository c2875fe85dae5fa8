//! Approximate token counting for backends without a counting endpoint.
//!
//! Uses tiktoken's `o200k_base` encoding. Counts are approximate for non-OpenAI
//! tokenizers; when the encoder cannot be loaded the estimate falls back to
//! one token per four bytes.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, o200k_base};

/// The encoder loads vocabulary data, so it is built once per process.
static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder() -> Option<&'static CoreBPE> {
    ENCODER
        .get_or_init(|| match o200k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::error!("Failed to initialize tiktoken o200k_base encoder: {e}");
                None
            }
        })
        .as_ref()
}

/// `ceil(len / 4)`, the fallback estimate.
#[must_use]
pub fn byte_estimate(text: &str) -> u32 {
    text.len().div_ceil(4).min(u32::MAX as usize) as u32
}

#[must_use]
pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    match encoder() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len().min(u32::MAX as usize) as u32,
        None => byte_estimate(text),
    }
}
