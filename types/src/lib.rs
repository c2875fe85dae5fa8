//! Core domain types for Strand.
//!
//! This crate contains the canonical, provider-neutral data model shared by
//! every layer: conversation messages, generation requests and responses, the
//! normalized streaming event, and authentication selectors. Nothing here
//! performs IO; adapters in `strand-providers` own the mapping to wire shapes.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)]

mod auth;
mod generation;
mod message;

pub use auth::{ApiKey, AuthType, UnknownAuthType};
pub use generation::{
    CompressionResult, FinishReason, GenerationRequest, GenerationResponse, SamplingParams,
    StreamError, StreamEvent, TokenUsage, ToolDeclaration,
};
pub use message::{FunctionCall, FunctionResponse, Message, Part, Role};
