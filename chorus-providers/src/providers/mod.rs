//! Provider adapter layer.
//!
//! An adapter owns the transport to one provider and exposes a single
//! operation: send one prompt, get raw text and latency back. Whether the
//! provider is reached over an HTTP API, a scripted web session, or desktop
//! automation is the adapter's business; the orchestrator treats every
//! provider uniformly and never sees transport details.
//!
//! Adapters are not reentrant per session. The dispatcher guarantees at most
//! `max_concurrent` in-flight calls per provider through the session
//! registry, so adapters can keep their internals simple.
//!
//! # Creating adapters
//!
//! ```rust,ignore
//! use chorus_providers::providers::{create_adapter, AdapterConfig};
//! use chorus_providers::ProviderId;
//!
//! let config = AdapterConfig::new(ProviderId::Claude, "api-key")
//!     .with_model("claude-3-5-sonnet-20241022");
//! let adapter = create_adapter(config)?;
//! let completion = adapter.send("list three primary colors", deadline).await?;
//! ```

use crate::error::{ErrorKind, ProviderError};
use crate::local_llm::LocalLlmClient;
use crate::models::{Completion, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod claude;
pub mod gemini;
pub mod http_client;
pub mod local;
pub mod perplexity;

pub use http_client::{AuthStrategy, HttpProviderClient};

/// One provider, one operation.
///
/// `send` must return within `deadline`; adapters are expected to map their
/// own transport failures onto the [`ProviderError`] taxonomy so the
/// refinement controller can route them.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this adapter reaches.
    fn provider(&self) -> ProviderId;

    /// Send one prompt and return the raw answer text with its latency.
    async fn send(&self, prompt: &str, deadline: Duration) -> Result<Completion, ProviderError>;
}

/// Configuration for a single adapter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Provider this adapter targets
    pub provider: ProviderId,
    /// API key for authentication (unused by the local adapter)
    #[serde(default)]
    pub api_key: String,
    /// Optional base URL override
    pub base_url: Option<String>,
    /// Model identifier sent on the wire
    pub model: String,
    /// Per-request HTTP timeout
    #[serde(with = "crate::common::duration_serde")]
    pub timeout: Duration,
    /// Retry budget for transport failures within one attempt
    pub max_retries: u32,
    /// Delay between transport retries
    #[serde(with = "crate::common::duration_serde")]
    pub retry_delay: Duration,
    /// Extra HTTP headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl AdapterConfig {
    pub fn new(provider: ProviderId, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            base_url: None,
            model: default_model(provider).to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            headers: HashMap::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Default wire model per provider.
fn default_model(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::Claude => "claude-3-5-sonnet-20241022",
        ProviderId::Gemini => "gemini-1.5-flash",
        ProviderId::Perplexity => "llama-3.1-sonar-small-128k-online",
        ProviderId::Local => "phi3:mini",
    }
}

/// Create an adapter instance for the configured provider.
pub fn create_adapter(config: AdapterConfig) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
    match config.provider {
        ProviderId::Claude => Ok(Arc::new(claude::ClaudeAdapter::new(config)?)),
        ProviderId::Gemini => Ok(Arc::new(gemini::GeminiAdapter::new(config)?)),
        ProviderId::Perplexity => Ok(Arc::new(perplexity::PerplexityAdapter::new(config)?)),
        ProviderId::Local => {
            let client = LocalLlmClient::new(
                config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
                config.model.clone(),
                config.timeout,
            )?;
            Ok(Arc::new(local::LocalAdapter::new(config, Arc::new(client))))
        }
    }
}

/// Drive one provider call with the adapter-level transport retry budget.
///
/// Transport failures are retried up to `max_retries` times with
/// `retry_delay` between tries; every other error kind propagates
/// immediately. The whole loop is bounded by `deadline`.
pub(crate) async fn send_with_retry<F, Fut>(
    max_retries: u32,
    retry_delay: Duration,
    deadline: Duration,
    mut call: F,
) -> Result<Completion, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, ProviderError>>,
{
    let started = Instant::now();
    let mut last_transport: Option<ProviderError> = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(retry_delay).await;
        }
        let remaining = match deadline.checked_sub(started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => return Err(ProviderError::Timeout),
        };
        match tokio::time::timeout(remaining, call()).await {
            Ok(Ok(text)) => {
                return Ok(Completion {
                    text,
                    latency: started.elapsed(),
                })
            }
            Ok(Err(err)) if err.kind() == ErrorKind::Transport => {
                tracing::debug!(retry = attempt, "transport failure, retrying: {err}");
                last_transport = Some(err);
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(ProviderError::Timeout),
        }
    }

    Err(last_transport.unwrap_or(ProviderError::Timeout))
}
