//! Conversation history compaction.
//!
//! - [`Compactor`] decides when the history is over budget and replaces its
//!   oldest turns with a model-written `<state_snapshot>`
//! - [`find_cut_index`] chooses where the summarized prefix ends
//! - [`token_limit`] maps model names to context windows

mod compaction;
mod model_limits;
mod prompts;

pub use compaction::{
    COMPRESSION_PRESERVE_THRESHOLD, COMPRESSION_TOKEN_THRESHOLD, CompactionError, Compactor,
    find_cut_index,
};
pub use model_limits::{
    DEFAULT_TOKEN_LIMIT, ModelLimitSource, ResolvedTokenLimit, resolve_token_limit, token_limit,
};
pub use prompts::{SNAPSHOT_ACKNOWLEDGEMENT, SNAPSHOT_REQUEST, compression_prompt};
