//! Wires a validated configuration into a ready dispatcher.
//!
//! This is the production assembly path: open the record store, register
//! one session per enabled provider, build the adapters and the local LLM
//! client, merge the persisted rule table over the defaults, and hand back
//! a dispatcher ready to take executions.

use chorus_providers::{create_adapter, AdapterConfig, LlmGenerator, LocalLlmClient, ProviderAdapter, ProviderId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::analysis::ResponseAnalyzer;
use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::BootstrapError;
use crate::persistence::PersistenceLayer;
use crate::refinement::default_rules;
use crate::sessions::SessionRegistry;
use crate::shaping::PromptShaper;
use crate::synthesis::Synthesizer;

/// Build a dispatcher from configuration. Fatal on invalid configuration;
/// everything else is wired but not yet exercised.
pub async fn bootstrap(config: OrchestratorConfig) -> Result<Dispatcher, BootstrapError> {
    config.validate()?;

    let persistence = Arc::new(PersistenceLayer::open(&config.persistence.path).await?);

    let llm: Arc<dyn LlmGenerator> = Arc::new(LocalLlmClient::new(
        config.local_llm.base_url.clone(),
        config.local_llm.model.clone(),
        config.local_llm.timeout,
    )?);

    let registry = Arc::new(SessionRegistry::new());
    let mut adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>> = HashMap::new();
    for provider in config.enabled_providers() {
        let settings = &config.providers[&provider];
        registry.register(provider, settings.max_concurrent, serde_json::json!({}));

        let mut adapter_config =
            AdapterConfig::new(provider, settings.api_key.clone().unwrap_or_default());
        if let Some(base_url) = &settings.base_url {
            adapter_config = adapter_config.with_base_url(base_url.clone());
        } else if provider == ProviderId::Local {
            adapter_config = adapter_config.with_base_url(config.local_llm.base_url.clone());
        }
        if let Some(model) = &settings.model {
            adapter_config = adapter_config.with_model(model.clone());
        } else if provider == ProviderId::Local {
            adapter_config = adapter_config.with_model(config.local_llm.model.clone());
        }
        adapters.insert(provider, create_adapter(adapter_config)?);
    }

    // Persisted rules win over the shipped defaults, matched by id.
    let mut rules = default_rules();
    for persisted in persistence.load_rules().await? {
        match rules.iter_mut().find(|r| r.id == persisted.id) {
            Some(existing) => *existing = persisted,
            None => rules.push(persisted),
        }
    }

    let analyzer = ResponseAnalyzer::new(Some(Arc::clone(&llm)), config.weights());
    let synthesizer = Synthesizer::new(Some(Arc::clone(&llm)), config.synthesis.fallback_only);

    tracing::info!(
        providers = adapters.len(),
        rules = rules.len(),
        store = %config.persistence.path,
        "orchestrator ready"
    );

    Ok(Dispatcher::new(
        registry,
        adapters,
        Arc::new(PromptShaper::new()),
        Arc::new(rules),
        analyzer,
        synthesizer,
        persistence,
        Some(llm),
        config.dispatcher_config(),
        config.min_intervals(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_registers_enabled_providers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.persistence.path = dir
            .path()
            .join("chorus.db")
            .to_string_lossy()
            .into_owned();
        config
            .providers
            .get_mut(&ProviderId::Claude)
            .unwrap()
            .api_key = Some("sk-test".into());

        let dispatcher = bootstrap(config).await.unwrap();
        let mut registered = dispatcher.registry().registered_providers();
        registered.sort();
        // Claude has a key; local never needs one; the rest are keyless and
        // stay out.
        assert_eq!(registered, vec![ProviderId::Claude, ProviderId::Local]);
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_config() {
        let mut config = OrchestratorConfig::default();
        config.refinement.quality_threshold = 2.0;
        assert!(matches!(
            bootstrap(config).await,
            Err(BootstrapError::Config(_))
        ));
    }
}
