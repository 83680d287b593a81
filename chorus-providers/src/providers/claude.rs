use crate::error::ProviderError;
use crate::models::{Completion, ProviderId};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{send_with_retry, AdapterConfig, ProviderAdapter};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Adapter for the Anthropic messages API.
pub struct ClaudeAdapter {
    http: HttpProviderClient,
    config: AdapterConfig,
}

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ClaudeMessage>,
}

#[derive(Debug, Serialize)]
struct ClaudeMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    text: String,
}

impl ClaudeAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, ProviderError> {
        let mut headers = config.headers.clone();
        headers.insert("anthropic-version".to_string(), "2023-06-01".to_string());
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://api.anthropic.com",
            &headers,
            AuthStrategy::Header {
                name: "x-api-key".to_string(),
                value: config.api_key.clone(),
            },
        )?;

        Ok(Self { http, config })
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let request = ClaudeRequest {
            model: self.config.model.clone(),
            max_tokens: 4096,
            messages: vec![ClaudeMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response: ClaudeResponse = self.http.post_json("/v1/messages", &request).await?;
        Ok(response
            .content
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Claude
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> ClaudeAdapter {
        let config = AdapterConfig::new(ProviderId::Claude, "test-key")
            .with_base_url(server.uri())
            .with_max_retries(0);
        ClaudeAdapter::new(config).unwrap()
    }

    #[tokio::test]
    async fn sends_prompt_and_joins_content_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [
                    {"type": "text", "text": "{\"colors\": "},
                    {"type": "text", "text": "[\"red\",\"green\",\"blue\"]}"}
                ]
            })))
            .mount(&server)
            .await;

        let completion = adapter_for(&server)
            .send("list three primary colors", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(completion.text, "{\"colors\": [\"red\",\"green\",\"blue\"]}");
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"message": "invalid x-api-key"}
            })))
            .mount(&server)
            .await;

        let err = adapter_for(&server)
            .send("hello", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }
}
