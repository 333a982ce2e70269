//! # External Agent Sessions
//!
//! A dispatched sub-task runs as a session on an external agent service.
//! This core only needs to launch sessions; everything else about the
//! service (activities, plans, approvals) belongs to outer layers.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors from the session API.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no agent API key configured")]
    MissingApiKey,
    #[error("session API error: {0}")]
    Api(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Handle to a launched session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
}

/// Capability to launch an external agent session.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Create a session carrying a task prompt. `source` optionally pins
    /// the repository/context the agent should start from.
    async fn create_session(
        &self,
        source: Option<&str>,
        prompt: &str,
        title: &str,
    ) -> Result<SessionHandle, SessionError>;
}

/// Minimal HTTP implementation against an agent-session REST API.
pub struct HttpSessionClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl HttpSessionClient {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SessionClient for HttpSessionClient {
    async fn create_session(
        &self,
        source: Option<&str>,
        prompt: &str,
        title: &str,
    ) -> Result<SessionHandle, SessionError> {
        if self.api_key.is_empty() {
            return Err(SessionError::MissingApiKey);
        }

        let mut body = json!({
            "prompt": prompt,
            "title": title,
        });
        if let Some(source) = source {
            body["sourceContext"] = json!({ "source": source });
        }

        let response = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .header("x-api-key", &self.api_key)
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
            return Err(SessionError::Api(message));
        }

        let data: Value = response.json().await?;
        let id = data["id"]
            .as_str()
            .or_else(|| data["name"].as_str())
            .ok_or_else(|| SessionError::Api("response carried no session id".into()))?
            .to_string();

        Ok(SessionHandle { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_api_key_is_rejected_before_any_request() {
        let client = HttpSessionClient::new(reqwest::Client::new(), "", "http://localhost:0");
        let err = client
            .create_session(None, "do things", "[Swarm] A")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MissingApiKey));
    }
}
