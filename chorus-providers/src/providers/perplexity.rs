use crate::error::ProviderError;
use crate::models::{Completion, ProviderId};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{send_with_retry, AdapterConfig, ProviderAdapter};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Adapter for the Perplexity chat completions API (OpenAI-compatible).
pub struct PerplexityAdapter {
    http: HttpProviderClient,
    config: AdapterConfig,
}

#[derive(Debug, Serialize)]
struct PerplexityRequest {
    model: String,
    messages: Vec<PerplexityMessage>,
}

#[derive(Debug, Serialize)]
struct PerplexityMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct PerplexityResponse {
    choices: Vec<PerplexityChoice>,
}

#[derive(Debug, Deserialize)]
struct PerplexityChoice {
    message: PerplexityChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct PerplexityChoiceMessage {
    content: String,
}

impl PerplexityAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://api.perplexity.ai",
            &config.headers,
            AuthStrategy::Bearer {
                token: config.api_key.clone(),
            },
        )?;

        Ok(Self { http, config })
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let request = PerplexityRequest {
            model: self.config.model.clone(),
            messages: vec![PerplexityMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response: PerplexityResponse =
            self.http.post_json("/chat/completions", &request).await?;

        Ok(response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for PerplexityAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Perplexity
    }

    async fn send(&self, prompt: &str, deadline: Duration) -> Result<Completion, ProviderError> {
        send_with_retry(
            self.config.max_retries,
            self.config.retry_delay,
            deadline,
            || self.complete(prompt),
        )
        .await
    }
}
