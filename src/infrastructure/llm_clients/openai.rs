use super::LLMClient;
use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::{LLMConfig, LLMProvider};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Client for any OpenAI-compatible `/chat/completions` endpoint
/// (OpenAI, OpenRouter, LM Studio, vLLM, ...).
pub struct OpenAIClient {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAIClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(config: &LLMConfig, path: &str) -> String {
        if config.base_url.ends_with('/') {
            format!("{}{}", config.base_url, path)
        } else {
            format!("{}/{}", config.base_url, path)
        }
    }

    fn api_key(config: &LLMConfig) -> Result<Option<String>> {
        match (&config.provider, &config.api_key) {
            (_, Some(key)) if !key.trim().is_empty() => Ok(Some(key.clone())),
            (LLMProvider::Local, _) => Ok(None),
            (provider, _) => Err(AppError::LLMError(format!(
                "Missing API key for {:?}",
                provider
            ))),
        }
    }
}

impl Default for OpenAIClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn generate(&self, config: &LLMConfig, system: &str, user: &str) -> Result<String> {
        let url = Self::endpoint(config, "chat/completions");

        let body = json!({
            "model": config.model,
            "messages": [
                {
                    "role": "system",
                    "content": system
                },
                {
                    "role": "user",
                    "content": user
                }
            ],
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
        });

        let mut request = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .json(&body);
        if let Some(key) = Self::api_key(config)? {
            request = request.bearer_auth(key);
        }

        debug!("POST {} model={}", url, config.model);
        let response = request
            .send()
            .await
            .map_err(|e| AppError::LLMError(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::LLMError(format!(
                "API error ({}): {}",
                status, text
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::LLMError(format!("Failed to parse JSON: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::LLMError("Invalid response format".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_slash() {
        let mut config = LLMConfig::default();
        config.base_url = "http://localhost:1234/v1/".into();
        assert_eq!(
            OpenAIClient::endpoint(&config, "chat/completions"),
            "http://localhost:1234/v1/chat/completions"
        );
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let config = LLMConfig::default();
        assert_eq!(OpenAIClient::api_key(&config).unwrap(), None);

        let hosted = LLMConfig {
            provider: LLMProvider::OpenRouter,
            ..LLMConfig::default()
        };
        assert!(OpenAIClient::api_key(&hosted).is_err());
    }
}
