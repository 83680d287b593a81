use crate::error::ProviderError;
use crate::local_llm::{GenerateRequest, LlmGenerator};
use crate::models::{Completion, ProviderId};
use crate::providers::{send_with_retry, AdapterConfig, ProviderAdapter};
use std::sync::Arc;
use std::time::Duration;

/// Adapter that lets the local LLM participate as an ordinary provider.
pub struct LocalAdapter {
    config: AdapterConfig,
    llm: Arc<dyn LlmGenerator>,
}

impl LocalAdapter {
    pub fn new(config: AdapterConfig, llm: Arc<dyn LlmGenerator>) -> Self {
        Self { config, llm }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for LocalAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Local
    }

    async fn send(&self, prompt: &str, deadline: Duration) -> Result<Completion, ProviderError> {
        send_with_retry(
            self.config.max_retries,
            self.config.retry_delay,
            deadline,
            || async {
                let generation = self
                    .llm
                    .generate(GenerateRequest::new(prompt).with_max_tokens(2000))
                    .await?;
                Ok(generation.text)
            },
        )
        .await
    }
}
