//! Configuration for the orchestrator.
//!
//! TOML-backed, with environment variable overrides and boot-time
//! validation. Invalid configuration is fatal: `validate` runs before
//! anything is wired up and returns a [`ConfigError`] describing the first
//! offending field.
//!
//! ```toml
//! [providers.claude]
//! weight = 0.95
//! max_concurrent = 2
//! min_interval = "5s"
//! api_key = "sk-..."
//!
//! [dispatcher]
//! default_mode = "parallel"
//! queue_multiplier = 2
//!
//! [refinement]
//! max_attempts = 5
//! quality_threshold = 0.8
//!
//! [synthesis]
//! fallback_only = false
//!
//! [local_llm]
//! base_url = "http://localhost:11434"
//! model = "phi3:mini"
//! ```

use chorus_providers::ProviderId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::error::ConfigError;
use crate::records::ExecutionMode;

/// Per-provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Whether this provider participates in executions.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base reliability weight used in confidence scoring.
    pub weight: f64,
    /// Cap on in-flight calls.
    pub max_concurrent: u32,
    /// Minimum interval between consecutive calls.
    #[serde(with = "chorus_providers::common::duration_serde")]
    pub min_interval: Duration,
    /// API key; not needed for the local provider.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Endpoint override.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Wire model override.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ProviderSettings {
    /// Defaults for one provider, matching its built-in weight and pacing.
    pub fn for_provider(provider: ProviderId) -> Self {
        Self {
            enabled: true,
            weight: provider.default_weight(),
            max_concurrent: provider.default_max_concurrent(),
            min_interval: provider.default_min_interval(),
            api_key: None,
            base_url: None,
            model: None,
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    pub default_mode: ExecutionMode,
    /// Per-provider queue size = multiplier x max_concurrent.
    pub queue_multiplier: u32,
    /// Pause between load-balanced picks.
    #[serde(with = "chorus_providers::common::duration_serde")]
    pub pacing_delay: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            default_mode: ExecutionMode::Parallel,
            queue_multiplier: 2,
            pacing_delay: Duration::from_millis(500),
        }
    }
}

/// Refinement loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementSettings {
    /// Hard upper bound on attempts per request (1..10).
    pub max_attempts: u32,
    /// Default quality threshold when the caller omits one.
    pub quality_threshold: f64,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            quality_threshold: 0.8,
        }
    }
}

/// Synthesis settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisSettings {
    /// Skip LLM fusion and use labeled concatenation.
    #[serde(default)]
    pub fallback_only: bool,
}

/// Local LLM settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalLlmSettings {
    pub base_url: String,
    pub model: String,
    #[serde(with = "chorus_providers::common::duration_serde")]
    pub timeout: Duration,
}

impl Default for LocalLlmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "phi3:mini".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Record store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSettings {
    pub path: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            path: "chorus.db".to_string(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<ProviderId, ProviderSettings>,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub refinement: RefinementSettings,
    #[serde(default)]
    pub synthesis: SynthesisSettings,
    #[serde(default)]
    pub local_llm: LocalLlmSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
}

fn default_providers() -> BTreeMap<ProviderId, ProviderSettings> {
    ProviderId::ALL
        .iter()
        .map(|&provider| (provider, ProviderSettings::for_provider(provider)))
        .collect()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            dispatcher: DispatcherSettings::default(),
            refinement: RefinementSettings::default(),
            synthesis: SynthesisSettings::default(),
            local_llm: LocalLlmSettings::default(),
            persistence: PersistenceSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Environment overrides, `CHORUS_*`:
    ///
    /// - `CHORUS_DEFAULT_MODE` - dispatcher mode
    /// - `CHORUS_QUALITY_THRESHOLD` / `CHORUS_MAX_ATTEMPTS` - refinement
    /// - `CHORUS_DB_PATH` - record store path
    /// - `CHORUS_LOCAL_LLM_URL` / `CHORUS_LOCAL_LLM_MODEL` - local model
    /// - `CHORUS_SYNTHESIS_FALLBACK_ONLY` - skip LLM fusion
    /// - `CHORUS_<PROVIDER>_API_KEY` - provider credentials
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(mode) = env::var("CHORUS_DEFAULT_MODE") {
            self.dispatcher.default_mode = ExecutionMode::from_str(&mode)
                .map_err(|e| ConfigError::invalid("dispatcher.default_mode", e))?;
        }
        if let Ok(threshold) = env::var("CHORUS_QUALITY_THRESHOLD") {
            self.refinement.quality_threshold = threshold
                .parse()
                .map_err(|_| ConfigError::invalid("refinement.quality_threshold", &threshold))?;
        }
        if let Ok(attempts) = env::var("CHORUS_MAX_ATTEMPTS") {
            self.refinement.max_attempts = attempts
                .parse()
                .map_err(|_| ConfigError::invalid("refinement.max_attempts", &attempts))?;
        }
        if let Ok(path) = env::var("CHORUS_DB_PATH") {
            self.persistence.path = path;
        }
        if let Ok(url) = env::var("CHORUS_LOCAL_LLM_URL") {
            self.local_llm.base_url = url;
        }
        if let Ok(model) = env::var("CHORUS_LOCAL_LLM_MODEL") {
            self.local_llm.model = model;
        }
        if let Ok(flag) = env::var("CHORUS_SYNTHESIS_FALLBACK_ONLY") {
            self.synthesis.fallback_only = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        for provider in ProviderId::ALL {
            let var = format!("CHORUS_{}_API_KEY", provider.as_str().to_uppercase());
            if let Ok(key) = env::var(&var) {
                self.providers
                    .entry(provider)
                    .or_insert_with(|| ProviderSettings::for_provider(provider))
                    .api_key = Some(key);
            }
        }
        Ok(())
    }

    /// Boot-time validation; the first bad field is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (provider, settings) in &self.providers {
            if !(0.0..=1.0).contains(&settings.weight) {
                return Err(ConfigError::invalid(
                    format!("providers.{provider}.weight"),
                    "must be within [0, 1]",
                ));
            }
            if settings.max_concurrent == 0 {
                return Err(ConfigError::invalid(
                    format!("providers.{provider}.max_concurrent"),
                    "must be at least 1",
                ));
            }
        }
        if self.dispatcher.queue_multiplier == 0 {
            return Err(ConfigError::invalid(
                "dispatcher.queue_multiplier",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.refinement.quality_threshold) {
            return Err(ConfigError::invalid(
                "refinement.quality_threshold",
                "must be within [0, 1]",
            ));
        }
        if !(1..=10).contains(&self.refinement.max_attempts) {
            return Err(ConfigError::invalid(
                "refinement.max_attempts",
                "must be within 1..10",
            ));
        }
        if self.persistence.path.trim().is_empty() {
            return Err(ConfigError::invalid("persistence.path", "must not be empty"));
        }
        Ok(())
    }

    /// Providers that are enabled and (for remote providers) have a key.
    pub fn enabled_providers(&self) -> Vec<ProviderId> {
        self.providers
            .iter()
            .filter(|(provider, settings)| {
                settings.enabled
                    && (**provider == ProviderId::Local || settings.api_key.is_some())
            })
            .map(|(provider, _)| *provider)
            .collect()
    }

    /// The dispatcher knobs this configuration implies.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            default_mode: self.dispatcher.default_mode,
            queue_multiplier: self.dispatcher.queue_multiplier,
            pacing_delay: self.dispatcher.pacing_delay,
            acquire_retry_interval: Duration::from_millis(50),
            default_quality_threshold: self.refinement.quality_threshold,
            default_max_refinements: self.refinement.max_attempts,
        }
    }

    /// Provider -> minimum inter-request interval.
    pub fn min_intervals(&self) -> HashMap<ProviderId, Duration> {
        self.providers
            .iter()
            .map(|(provider, settings)| (*provider, settings.min_interval))
            .collect()
    }

    /// Provider -> reliability weight.
    pub fn weights(&self) -> HashMap<ProviderId, f64> {
        self.providers
            .iter()
            .map(|(provider, settings)| (*provider, settings.weight))
            .collect()
    }
}
