//! Overseer LLM - Completion provider adapters and JSON recovery helpers

pub mod anthropic;
pub mod json;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use provider::{
    ChatMessage, ChatRole, Completion, CompletionRequest, FinishReason, LlmError, LlmProvider,
    LlmResult, Usage,
};
