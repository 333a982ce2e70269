//! # Completion Providers
//!
//! The coordinator treats completion APIs as an opaque capability: a
//! [`CompletionProvider`] takes messages plus a model and returns text. The
//! registry maps a [`ProviderKind`] to a concrete HTTP implementation; tests
//! register scripted providers in the same slot.

pub mod anthropic;
pub mod openai;

use crate::models::ProviderKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// Errors from a completion call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no API key configured for {0}")]
    MissingApiKey(&'static str),
    #[error("{provider} API error: {message}")]
    Api {
        provider: &'static str,
        message: String,
    },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in a completion conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A single completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub api_key: String,
    pub model: String,
    pub system_prompt: Option<String>,
    /// Ask the provider for strict-JSON output where supported.
    pub json_mode: bool,
}

/// Token accounting, when the provider reports it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Result of a completion call.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// An opaque completion capability.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Stable provider identifier for logs and errors.
    fn id(&self) -> &'static str;

    /// Run one completion call.
    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionResponse, ProviderError>;
}

/// Maps provider kinds to implementations.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn CompletionProvider>>,
}

impl ProviderRegistry {
    /// Registry with no providers. Useful for tests and for wiring custom
    /// implementations one by one.
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry with the built-in HTTP providers.
    pub fn with_defaults() -> Self {
        let http = reqwest::Client::new();
        let mut registry = Self::empty();
        registry.register(
            ProviderKind::OpenAi,
            Arc::new(OpenAiProvider::new(http.clone())),
        );
        registry.register(
            ProviderKind::Anthropic,
            Arc::new(AnthropicProvider::new(http)),
        );
        registry
    }

    /// Register (or replace) a provider.
    pub fn register(&mut self, kind: ProviderKind, provider: Arc<dyn CompletionProvider>) {
        self.providers.insert(kind, provider);
    }

    /// Look up a provider. `None` means "not configured" and callers treat
    /// that as a hard error.
    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn CompletionProvider>> {
        self.providers.get(&kind).cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
