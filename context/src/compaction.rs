//! Token-budgeted history compaction.
//!
//! When the history reaches [`COMPRESSION_TOKEN_THRESHOLD`] of the model's
//! context window (or when forced), the oldest ~70% of it by serialized volume
//! is summarized by the model into a `<state_snapshot>` and replaced by two
//! synthetic turns. The newest turns are kept verbatim.

use strand_providers::{ContentGenerator, GenerationError};
use strand_types::{CompressionResult, GenerationRequest, Message, Role};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model_limits::token_limit;
use crate::prompts::{SNAPSHOT_ACKNOWLEDGEMENT, SNAPSHOT_REQUEST, compression_prompt};

/// Fraction of the context window at which compaction starts.
pub const COMPRESSION_TOKEN_THRESHOLD: f64 = 0.7;
/// Fraction of the history (by volume) kept verbatim.
pub const COMPRESSION_PRESERVE_THRESHOLD: f64 = 0.3;

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("preserve fraction must be strictly between 0 and 1, got {0}")]
    InvalidFraction(f64),
    #[error("summary generation failed: {0}")]
    Generation(#[from] GenerationError),
}

/// Index that splits `history` into a summarized prefix and a kept tail.
///
/// Returns the smallest `k` whose prefix `history[..k]` holds at least
/// `1 - preserve_fraction` of the total serialized length, then moves `k`
/// forward past model turns and function responses so the tail starts on a
/// fresh user turn.
pub fn find_cut_index(history: &[Message], preserve_fraction: f64) -> Result<usize, CompactionError> {
    if !(preserve_fraction > 0.0 && preserve_fraction < 1.0) {
        return Err(CompactionError::InvalidFraction(preserve_fraction));
    }

    let lengths: Vec<usize> = history.iter().map(Message::serialized_len).collect();
    let total: usize = lengths.iter().sum();
    let target = (1.0 - preserve_fraction) * total as f64;
    // `1.0 - f` is not exact in binary; allow for the rounding error.
    let tolerance = total as f64 * 1e-9;

    let mut cumulative = 0usize;
    let mut cut = history.len();
    for (index, length) in lengths.iter().enumerate() {
        if cumulative as f64 + tolerance >= target {
            cut = index;
            break;
        }
        cumulative += length;
    }

    while cut < history.len()
        && (history[cut].role == Role::Model || history[cut].is_function_response())
    {
        cut += 1;
    }
    Ok(cut)
}

/// Decides when to compact and performs the summarization call.
#[derive(Debug, Clone, Copy)]
pub struct Compactor {
    token_threshold: f64,
    preserve_fraction: f64,
}

impl Default for Compactor {
    fn default() -> Self {
        Self {
            token_threshold: COMPRESSION_TOKEN_THRESHOLD,
            preserve_fraction: COMPRESSION_PRESERVE_THRESHOLD,
        }
    }
}

impl Compactor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_preserve_fraction(mut self, fraction: f64) -> Self {
        self.preserve_fraction = fraction;
        self
    }

    #[must_use]
    pub fn with_token_threshold(mut self, threshold: f64) -> Self {
        self.token_threshold = threshold;
        self
    }

    async fn count(
        generator: &dyn ContentGenerator,
        model: &str,
        history: &[Message],
        cancel: &CancellationToken,
    ) -> Result<Option<u32>, CompactionError> {
        let request = GenerationRequest::new(model, history.to_vec());
        match generator.count_tokens(&request, cancel).await {
            Ok(count) => Ok(Some(count)),
            Err(GenerationError::Cancelled) => Err(GenerationError::Cancelled.into()),
            Err(e) => {
                tracing::warn!(model, "Could not determine token count: {e}");
                Ok(None)
            }
        }
    }

    /// Compact `history` in place when it is over budget or `force` is set.
    ///
    /// Returns `Ok(None)` and leaves the history untouched when nothing was
    /// compacted: empty history, under budget, nothing to summarize, or a
    /// token count that could not be determined.
    pub async fn try_compress(
        &self,
        history: &mut Vec<Message>,
        model: &str,
        force: bool,
        generator: &dyn ContentGenerator,
        cancel: &CancellationToken,
    ) -> Result<Option<CompressionResult>, CompactionError> {
        if history.is_empty() {
            return Ok(None);
        }

        let Some(original_token_count) = Self::count(generator, model, history, cancel).await?
        else {
            return Ok(None);
        };

        let budget = self.token_threshold * f64::from(token_limit(model));
        if !force && f64::from(original_token_count) < budget {
            return Ok(None);
        }

        let cut = find_cut_index(history, self.preserve_fraction)?;
        if cut == 0 {
            tracing::debug!("Nothing old enough to compact");
            return Ok(None);
        }

        let mut contents = history[..cut].to_vec();
        contents.push(Message::user_text(SNAPSHOT_REQUEST));
        let request =
            GenerationRequest::new(model, contents).with_system_instruction(compression_prompt());
        let response = generator.generate(&request, cancel).await?;

        let summary = response.text.trim();
        if summary.is_empty() {
            tracing::warn!("Compaction produced an empty summary; keeping history");
            return Ok(None);
        }

        let mut compacted = Vec::with_capacity(history.len() - cut + 2);
        compacted.push(Message::user_text(summary));
        compacted.push(Message::model_text(SNAPSHOT_ACKNOWLEDGEMENT));
        compacted.extend_from_slice(&history[cut..]);

        let Some(new_token_count) = Self::count(generator, model, &compacted, cancel).await? else {
            return Ok(None);
        };

        *history = compacted;
        tracing::info!(
            original_token_count,
            new_token_count,
            summarized_messages = cut,
            "Compressed chat history"
        );
        Ok(Some(CompressionResult {
            original_token_count,
            new_token_count,
        }))
    }
}
