//! Provider-agnostic request/response contract.
//!
//! The driver hands over the system prompt, the conversation, and an
//! optional tool schema; the provider returns the model's content blocks.
//! Everything else (retries, caching, streaming) is the provider's business.

use async_trait::async_trait;

use tal_domain::chat::{ChatMessage, ContentBlock, ToolSchema};
use tal_domain::Result;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    /// `None` means the model cannot call tools this turn.
    pub tools: Option<Vec<ToolSchema>>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse>;
}
