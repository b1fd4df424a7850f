//! Anthropic Messages API adapter.
//!
//! Non-streaming: the driver works turn-by-turn, so one request maps to one
//! `POST /v1/messages`. System text goes in the top-level `system` field;
//! tool results travel as user messages with `tool_result` blocks, which is
//! exactly how the domain model serializes them.

use async_trait::async_trait;
use serde_json::Value;

use tal_domain::chat::ContentBlock;
use tal_domain::config::LlmConfig;
use tal_domain::{Error, Result};

use crate::traits::{ChatRequest, ChatResponse, LlmClient};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    /// Build from config; the API key is read from the named env var.
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env)
            .map_err(|_| Error::Config(format!("{} is not set", cfg.api_key_env)))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.request_timeout_sec))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": req.max_tokens,
            "messages": req.messages,
        });
        if !req.system.is_empty() {
            body["system"] = Value::String(req.system.clone());
        }
        if let Some(tools) = &req.tools {
            body["tools"] = serde_json::to_value(tools).unwrap_or(Value::Null);
        }
        body
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&self.build_body(req))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let raw: Value = resp
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            let message = raw
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(Error::Provider(format!("anthropic {status}: {message}")));
        }

        Ok(ChatResponse {
            content: parse_content(&raw),
            stop_reason: raw
                .get("stop_reason")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }
}

/// Map response content blocks into the domain model, skipping block types
/// the driver has no use for.
fn parse_content(raw: &Value) -> Vec<ContentBlock> {
    let Some(items) = raw.get("content").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => Some(ContentBlock::Text {
                text: block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            Some("tool_use") => Some(ContentBlock::ToolUse {
                id: block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            }),
            _ => None,
        })
        .collect()
}
