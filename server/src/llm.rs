//! LLM Client
//!
//! Seam to the external completion provider. The analysis nodes only need
//! `complete` over a static system prompt plus a per-tick user prompt; the
//! vendor wire protocol stays behind this trait.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors from the completion provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Transport-level failure.
    #[error("llm transport error: {0}")]
    Transport(String),

    /// Provider returned a non-success status or an empty completion.
    #[error("llm endpoint error: {0}")]
    Endpoint(String),

    /// No endpoint configured.
    #[error("llm not configured")]
    NotConfigured,
}

/// Completion interface used by the analysis nodes.
///
/// System prompts are designed to be byte-identical across ticks so the
/// provider's implicit prefix cache is reused; that contract lives in the
/// prompts, not here.
#[async_trait]
pub trait LlmClient: Send + Sync + 'static {
    /// One completion: `system` + `user` in, text out.
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;

    /// Cheap reachability probe, used for `agent_ready`.
    async fn is_available(&self) -> bool;

    /// Model identifier recorded with persisted results.
    fn model_version(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// OpenAI-compatible chat-completions client.
pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpLlmClient {
    /// Build a client for a chat-completions endpoint.
    pub fn new(endpoint: String, model: String) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            model,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.2,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Endpoint(format!(
                "status {}",
                response.status()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Endpoint(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Endpoint("empty choices".into()))
    }

    async fn is_available(&self) -> bool {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        });
        match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn model_version(&self) -> &str {
        &self.model
    }
}

/// Stand-in when no endpoint is configured: every node degrades to its
/// skipped result and `agent_ready` reports `llm_available: false`.
pub struct UnconfiguredLlm;

#[async_trait]
impl LlmClient for UnconfiguredLlm {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
        Err(LlmError::NotConfigured)
    }

    async fn is_available(&self) -> bool {
        false
    }

    fn model_version(&self) -> &str {
        "unconfigured"
    }
}
