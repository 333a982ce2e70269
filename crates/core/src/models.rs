//! # Keeper Models
//!
//! Centralized completion-provider configuration types. These are shared by
//! the provider registry, the coordinator, and the persisted settings.

use serde::{Deserialize, Serialize};

/// Supported completion providers.
///
/// - OpenAI (and OpenAI-compatible endpoints via `base_url`) - `OPENAI_API_KEY`
/// - Anthropic (Claude) - `ANTHROPIC_API_KEY`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    /// All known providers.
    pub fn all() -> Vec<ProviderKind> {
        vec![ProviderKind::OpenAi, ProviderKind::Anthropic]
    }

    /// Display name for logs and UIs.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Anthropic => "Anthropic",
        }
    }

    /// Stable identifier used as part of circuit-breaker keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    /// Whether this provider supports a custom base URL.
    pub fn supports_base_url(&self) -> bool {
        matches!(self, ProviderKind::OpenAi)
    }

    /// Environment variable consulted when no API key is persisted.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    /// Default model when the settings carry none.
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o",
            ProviderKind::Anthropic => "claude-3-5-sonnet-20240620",
        }
    }
}

/// Configuration for a single completion call target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider to use
    #[serde(default)]
    pub provider: ProviderKind,
    /// Model name (e.g. "gpt-4o", "claude-3-5-sonnet-20240620")
    pub model: String,
    /// Optional base URL override for OpenAI-compatible APIs
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: ProviderKind::OpenAi.default_model().to_string(),
            base_url: None,
        }
    }
}

impl ModelConfig {
    /// Config for a specific provider and model.
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
        }
    }

    /// Set a base URL (OpenAI-compatible endpoints only).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Circuit-breaker key for this target.
    pub fn breaker_key(&self) -> String {
        format!("{}:{}", self.provider.as_str(), self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_display_names() {
        assert_eq!(ProviderKind::OpenAi.display_name(), "OpenAI");
        assert_eq!(ProviderKind::Anthropic.display_name(), "Anthropic");
    }

    #[test]
    fn test_base_url_support() {
        assert!(ProviderKind::OpenAi.supports_base_url());
        assert!(!ProviderKind::Anthropic.supports_base_url());
    }

    #[test]
    fn test_breaker_key_format() {
        let config = ModelConfig::new(ProviderKind::OpenAi, "gpt-4o");
        assert_eq!(config.breaker_key(), "openai:gpt-4o");
    }

    #[test]
    fn test_provider_kind_serialization() {
        let json = serde_json::to_string(&ProviderKind::OpenAi).unwrap();
        assert_eq!(json, "\"openai\"");
        let back: ProviderKind = serde_json::from_str("\"anthropic\"").unwrap();
        assert_eq!(back, ProviderKind::Anthropic);
    }
}
