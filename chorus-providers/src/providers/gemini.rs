use crate::error::ProviderError;
use crate::models::{Completion, ProviderId};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{send_with_retry, AdapterConfig, ProviderAdapter};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Adapter for the Gemini generateContent API.
pub struct GeminiAdapter {
    http: HttpProviderClient,
    config: AdapterConfig,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: i32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

impl GeminiAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://generativelanguage.googleapis.com/v1beta",
            &config.headers,
            AuthStrategy::Header {
                name: "x-goog-api-key".to_string(),
                value: config.api_key.clone(),
            },
        )?;

        Ok(Self { http, config })
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: 4096,
            }),
        };

        let path = format!("/models/{}:generateContent", self.config.model);
        let response: GeminiResponse = self.http.post_json(&path, &request).await?;

        let text = response
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(text)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Gemini
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn concatenates_candidate_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "hello "}, {"text": "world"}]}
                }]
            })))
            .mount(&server)
            .await;

        let config = AdapterConfig::new(ProviderId::Gemini, "key").with_base_url(server.uri());
        let adapter = GeminiAdapter::new(config).unwrap();
        let completion = adapter.send("hi", Duration::from_secs(5)).await.unwrap();
        assert_eq!(completion.text, "hello world");
    }

    #[tokio::test]
    async fn rate_limit_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let config = AdapterConfig::new(ProviderId::Gemini, "key")
            .with_base_url(server.uri())
            .with_max_retries(0);
        let adapter = GeminiAdapter::new(config).unwrap();
        let err = adapter.send("hi", Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        match err {
            ProviderError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
