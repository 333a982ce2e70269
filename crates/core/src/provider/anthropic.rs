//! Anthropic messages-API provider.

use super::{
    ChatRole, CompletionProvider, CompletionRequest, CompletionResponse, ProviderError, TokenUsage,
};
use async_trait::async_trait;
use serde_json::{json, Value};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn build_body(request: &CompletionRequest) -> Value {
        // The messages API strictly requires user/assistant roles; mid-stream
        // system messages are folded into user turns to preserve context.
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::Assistant => "assistant",
                    ChatRole::User | ChatRole::System => "user",
                };
                json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": DEFAULT_MAX_TOKENS,
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = json!(system);
        }
        body
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn id(&self) -> &'static str {
        "anthropic"
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        if request.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey(self.id()));
        }

        let body = Self::build_body(&request);
        let response = self
            .http
            .post(MESSAGES_URL)
            .header("x-api-key", &request.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error: Value = response.json().await.unwrap_or_default();
            let message = error["error"]["message"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| status.to_string());
            return Err(ProviderError::Api {
                provider: self.id(),
                message,
            });
        }

        let data: Value = response.json().await?;
        let content = data["content"][0]["text"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("no text block in response".into()))?
            .to_string();

        let usage = data.get("usage").map(|u| TokenUsage {
            prompt_tokens: u["input_tokens"].as_u64().unwrap_or(0),
            completion_tokens: u["output_tokens"].as_u64().unwrap_or(0),
        });

        Ok(CompletionResponse { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    #[test]
    fn test_system_prompt_goes_to_top_level_field() {
        let request = CompletionRequest {
            messages: vec![ChatMessage::user("Hi")],
            api_key: "key".into(),
            model: "claude-3-5-sonnet-20240620".into(),
            system_prompt: Some("SysPrompt".into()),
            json_mode: false,
        };
        let body = AnthropicProvider::build_body(&request);
        assert_eq!(body["system"], "SysPrompt");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_system_role_in_messages_maps_to_user() {
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::user("User msg"),
                ChatMessage {
                    role: ChatRole::System,
                    content: "Intermediate system msg".into(),
                },
                ChatMessage::assistant("Assistant msg"),
            ],
            api_key: "key".into(),
            model: "claude-3-5-sonnet-20240620".into(),
            system_prompt: None,
            json_mode: false,
        };
        let body = AnthropicProvider::build_body(&request);
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert!(body.get("system").is_none());
    }
}
