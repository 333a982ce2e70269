//! OpenAI chat-completions provider. Also serves OpenAI-compatible
//! endpoints through a custom base URL.

use super::{
    ChatRole, CompletionProvider, CompletionRequest, CompletionResponse, ProviderError, TokenUsage,
};
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point at an OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(request: &CompletionRequest) -> Value {
        let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for message in &request.messages {
            let role = match message.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            messages.push(json!({ "role": role, "content": message.content }));
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": DEFAULT_MAX_TOKENS,
        });
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn id(&self) -> &'static str {
        "openai"
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
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&request.api_key)
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
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("no message content in choices".into()))?
            .to_string();

        let usage = data.get("usage").map(|u| TokenUsage {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
        });

        Ok(CompletionResponse { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![ChatMessage::user("Hi")],
            api_key: "key".into(),
            model: "gpt-4o".into(),
            system_prompt: Some("SysPrompt".into()),
            json_mode: false,
        }
    }

    #[test]
    fn test_system_prompt_becomes_first_message() {
        let body = OpenAiProvider::build_body(&request());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "SysPrompt");
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[test]
    fn test_json_mode_sets_response_format() {
        let mut req = request();
        req.json_mode = true;
        let body = OpenAiProvider::build_body(&req);
        assert_eq!(body["response_format"]["type"], "json_object");

        let plain = OpenAiProvider::build_body(&request());
        assert!(plain.get("response_format").is_none());
    }

    #[tokio::test]
    async fn test_missing_api_key_is_rejected_before_any_request() {
        let provider = OpenAiProvider::new(reqwest::Client::new());
        let mut req = request();
        req.api_key = String::new();
        let err = provider.complete(req).await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingApiKey("openai")));
    }
}
