//! OpenAI-compatible Model Gateway
//!
//! Talks to any backend exposing `/chat/completions` and `/embeddings`
//! (OpenAI, DeepSeek, vLLM, Ollama's compatibility layer). The bearer key is
//! read from the environment variable named in `[llm].api_key_env`; when it is
//! unset requests are sent without an Authorization header.

use super::{LLMError, ModelGateway, Result};
use crate::config::LLMConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub struct OpenAIGateway {
    base_url: String,
    chat_model: String,
    embedding_model: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAIGateway {
    /// Build a gateway from config, resolving the API key from the environment
    pub fn from_config(config: &LLMConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self::new(config, api_key)
    }

    pub fn new(config: &LLMConfig, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LLMError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            api_key,
            client,
        })
    }

    async fn post(&self, path: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LLMError::Timeout
            } else {
                LLMError::NetworkError(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            return Err(match status.as_u16() {
                401 | 403 => LLMError::AuthenticationFailed(text),
                429 => LLMError::RateLimitExceeded,
                _ => LLMError::InvalidRequest(format!("{}: {}", status, text)),
            });
        }

        response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))
    }
}

#[async_trait]
impl ModelGateway for OpenAIGateway {
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        debug!(model = %self.chat_model, "Sending chat completion");

        let payload = json!({
            "model": self.chat_model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });

        let data = self.post("/chat/completions", payload).await?;

        data.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(String::from)
            .ok_or_else(|| LLMError::ParseError("No message content in response".to_string()))
    }

    async fn embedding(&self, text: &str) -> Result<Vec<f64>> {
        let payload = json!({
            "model": self.embedding_model,
            "input": text,
        });

        let data = self.post("/embeddings", payload).await?;

        let vector = data
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|d| d.first())
            .and_then(|item| item.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or_else(|| LLMError::ParseError("No embedding in response".to_string()))?;

        vector
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| LLMError::ParseError("Non-numeric embedding value".to_string()))
            })
            .collect()
    }
}
