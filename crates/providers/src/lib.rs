//! LLM provider contract and the Anthropic adapter.

pub mod anthropic;
pub mod traits;

pub use anthropic::AnthropicClient;
pub use traits::{ChatRequest, ChatResponse, LlmClient};
