//! Anthropic Claude messages-API provider

use crate::provider::{
    ChatRole, Completion, CompletionRequest, FinishReason, LlmError, LlmProvider, LlmResult, Usage,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<Completion> {
        let body = AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            system: request.system.clone(),
            temperature: request.temperature,
            messages: request
                .messages
                .iter()
                .map(|m| AnthropicMessage {
                    role: match m.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    content: m.content.clone(),
                })
                .collect(),
        };

        debug!(model = %body.model, "anthropic request");

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = %status, "anthropic error: {}", error_text);

            return Err(match status.as_u16() {
                401 => LlmError::AuthFailed(error_text),
                429 => LlmError::RateLimited {
                    retry_after_ms: 60_000,
                },
                _ => LlmError::RequestFailed(format!("{}: {}", status, error_text)),
            });
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let text = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
            })
            .collect::<Vec<_>>()
            .join("");

        let finish_reason = match parsed.stop_reason.as_deref() {
            Some("end_turn") | None => FinishReason::EndTurn,
            Some("max_tokens") => FinishReason::MaxTokens,
            Some(other) => FinishReason::Other(other.to_string()),
        };

        Ok(Completion {
            text,
            finish_reason,
            usage: parsed.usage.unwrap_or_default(),
        })
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<AnthropicMessage>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parsing() {
        let raw = r#"{
            "content": [{"type": "text", "text": "hello "}, {"type": "text", "text": "world"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 10, "output_tokens": 20}
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(raw).unwrap();
        let text: String = parsed
            .content
            .iter()
            .map(|ContentBlock::Text { text }| text.as_str())
            .collect();
        assert_eq!(text, "hello world");
        assert_eq!(parsed.stop_reason.as_deref(), Some("max_tokens"));
        assert_eq!(parsed.usage.unwrap().total(), 30);
    }

    #[test]
    fn request_serialization_skips_absent_fields() {
        let body = AnthropicRequest {
            model: "m".into(),
            max_tokens: 100,
            system: None,
            temperature: None,
            messages: vec![AnthropicMessage {
                role: "user",
                content: "hi".into(),
            }],
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("system"));
        assert!(!json.contains("temperature"));
        assert!(json.contains(r#""role":"user""#));
    }
}
