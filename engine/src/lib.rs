//! Session orchestration for Strand.
//!
//! A [`Session`] owns one conversation with one [`ContentGenerator`]. It
//! enforces turn and token budgets, compacts history, dispatches through the
//! retry policy with model fallback, detects loops and continues the model's
//! turn when it has more to say. [`create_content_generator`] builds the
//! generator for the configured auth type.

mod events;
mod factory;
mod fallback;
pub mod loop_detection;
pub mod next_speaker;
mod session;

pub use events::{SessionEvent, session_token_limit_message};
pub use factory::{
    ConfiguredGenerator, DEFAULT_GEMINI_MODEL, DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL,
    SetupError, create_content_generator,
};
pub use fallback::{FALLBACK_MODEL, FallbackHandler, ModelState};
pub use loop_detection::LoopDetector;
pub use next_speaker::{ModelNextSpeakerChecker, NextSpeaker, NextSpeakerChecker};
pub use session::{
    CONTINUE_PROMPT, HistoryError, MAX_CONTINUATION_TURNS, Session, SessionConfig,
};

pub use strand_context::{CompactionError, Compactor};
pub use strand_providers::ContentGenerator;
