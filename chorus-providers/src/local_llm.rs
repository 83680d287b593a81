//! Client for the local LLM served over an Ollama-compatible API.
//!
//! The local model plays three roles in the system: it is a provider in its
//! own right (through [`crate::providers::local::LocalAdapter`]), the fuser
//! for response synthesis, and the extractor for key facts. The
//! [`LlmGenerator`] trait is the seam that lets the orchestrator run against
//! a canned generator in tests.

use crate::error::ProviderError;
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One generation request against the local model.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub user_prompt: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerateRequest {
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            system_prompt: None,
            max_tokens: 1000,
            temperature: 0.7,
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Text produced by the local model.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub tokens_generated: u32,
}

/// Anything that can generate text for the orchestrator.
///
/// Implemented by [`LocalLlmClient`] for production; tests substitute a
/// scripted generator.
#[async_trait::async_trait]
pub trait LlmGenerator: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<Generation, ProviderError>;
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    #[serde(default)]
    name: String,
}

/// HTTP client for an Ollama-compatible local model server.
pub struct LocalLlmClient {
    http: HttpProviderClient,
    model: String,
}

impl LocalLlmClient {
    pub fn new(
        base_url: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            timeout,
            Some(base_url),
            "http://localhost:11434",
            &HashMap::new(),
            AuthStrategy::None,
        )?;
        Ok(Self { http, model })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Probe the server and confirm the configured model is present.
    pub async fn is_available(&self) -> bool {
        match self.http.get_json::<OllamaTagsResponse>("/api/tags").await {
            Ok(tags) => tags.models.iter().any(|m| m.name.contains(&self.model)),
            Err(err) => {
                tracing::debug!("local LLM availability probe failed: {err}");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl LlmGenerator for LocalLlmClient {
    async fn generate(&self, request: GenerateRequest) -> Result<Generation, ProviderError> {
        let payload = OllamaGenerateRequest {
            model: self.model.clone(),
            prompt: request.user_prompt,
            stream: false,
            system: request.system_prompt,
            options: OllamaOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
                top_p: 0.9,
                repeat_penalty: 1.1,
            },
        };

        let response: OllamaGenerateResponse =
            self.http.post_json("/api/generate", &payload).await?;

        Ok(Generation {
            text: response.response.trim().to_string(),
            tokens_generated: response.eval_count,
        })
    }
}
