//! Shared fixtures: scripted adapters, a canned local LLM, and a dispatcher
//! harness wired against an in-memory store.

use chorus_orchestrator::analysis::ResponseAnalyzer;
use chorus_orchestrator::dispatcher::{Dispatcher, DispatcherConfig};
use chorus_orchestrator::persistence::PersistenceLayer;
use chorus_orchestrator::refinement::default_rules;
use chorus_orchestrator::sessions::SessionRegistry;
use chorus_orchestrator::shaping::PromptShaper;
use chorus_orchestrator::synthesis::Synthesizer;
use chorus_providers::{
    Completion, GenerateRequest, Generation, LlmGenerator, ProviderAdapter, ProviderError,
    ProviderId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Adapter that replays a fixed script of results, one per call, and logs
/// every call it receives.
pub struct ScriptedAdapter {
    provider: ProviderId,
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    delay: Duration,
    call_log: Arc<Mutex<Vec<(ProviderId, Instant)>>>,
}

impl ScriptedAdapter {
    pub fn new(provider: ProviderId, script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            provider,
            script: Mutex::new(script.into()),
            delay: Duration::ZERO,
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_call_log(mut self, log: Arc<Mutex<Vec<(ProviderId, Instant)>>>) -> Self {
        self.call_log = log;
        self
    }

    /// Repeats the same answer forever.
    pub fn repeating(provider: ProviderId, text: &str) -> Self {
        Self::new(provider, vec![Ok(text.to_string())])
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    async fn send(&self, _prompt: &str, deadline: Duration) -> Result<Completion, ProviderError> {
        self.call_log
            .lock()
            .unwrap()
            .push((self.provider, Instant::now()));

        if self.delay > deadline {
            tokio::time::sleep(deadline).await;
            return Err(ProviderError::Timeout);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = {
            let mut script = self.script.lock().unwrap();
            if script.len() == 1 {
                // The last entry repeats so scripts don't need padding.
                match script.front().unwrap() {
                    Ok(text) => Ok(text.clone()),
                    Err(err) => Err(clone_error(err)),
                }
            } else {
                script.pop_front().unwrap_or(Err(ProviderError::Timeout))
            }
        };
        next.map(|text| Completion {
            text,
            latency: self.delay.max(Duration::from_millis(1)),
        })
    }
}

fn clone_error(err: &ProviderError) -> ProviderError {
    match err {
        ProviderError::Transport { message } => ProviderError::Transport {
            message: message.clone(),
        },
        ProviderError::Auth { message } => ProviderError::Auth {
            message: message.clone(),
        },
        ProviderError::RateLimited { retry_after } => ProviderError::RateLimited {
            retry_after: *retry_after,
        },
        ProviderError::Timeout => ProviderError::Timeout,
        ProviderError::ProviderInternal { code, message } => ProviderError::ProviderInternal {
            code: *code,
            message: message.clone(),
        },
        other => ProviderError::ProviderInternal {
            code: 0,
            message: other.to_string(),
        },
    }
}

/// Canned local model: echoes facts out of extraction prompts, otherwise
/// returns a fixed fusion string.
pub struct CannedLlm;

#[async_trait::async_trait]
impl LlmGenerator for CannedLlm {
    async fn generate(&self, request: GenerateRequest) -> Result<Generation, ProviderError> {
        let prompt = &request.user_prompt;
        let text = if prompt.starts_with("Extract the key facts") {
            if prompt.contains("prices will increase") {
                "prices will increase".to_string()
            } else if prompt.contains("prices will decrease") {
                "prices will decrease".to_string()
            } else {
                "a key fact".to_string()
            }
        } else {
            "a fused answer drawn from every source".to_string()
        };
        Ok(Generation {
            text,
            tokens_generated: 8,
        })
    }
}

/// A known-good answer: strict JSON, three colors, long and assertive
/// enough to clear a 0.8 quality bar.
pub fn good_colors_json() -> String {
    format!(
        "{{\"colors\": [\"red\", \"green\", \"blue\"], \"note\": \"{}\"}}",
        "red, green and blue are the standard additive primaries. ".repeat(4)
    )
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
}

/// Build a dispatcher over the given adapters with an in-memory store.
/// `max_concurrent` applies to every registered provider.
pub async fn harness(
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    max_concurrent: u32,
    llm: Option<Arc<dyn LlmGenerator>>,
) -> Harness {
    init_tracing();
    let registry = Arc::new(SessionRegistry::new());
    let mut adapter_map: HashMap<ProviderId, Arc<dyn ProviderAdapter>> = HashMap::new();
    for adapter in adapters {
        registry.register(adapter.provider(), max_concurrent, serde_json::json!({}));
        adapter_map.insert(adapter.provider(), adapter);
    }

    let persistence = Arc::new(PersistenceLayer::open_in_memory().await.unwrap());
    let config = DispatcherConfig {
        pacing_delay: Duration::from_millis(1),
        acquire_retry_interval: Duration::from_millis(5),
        ..DispatcherConfig::default()
    };

    let dispatcher = Dispatcher::new(
        registry,
        adapter_map,
        Arc::new(PromptShaper::new()),
        Arc::new(default_rules()),
        ResponseAnalyzer::new(llm.clone(), HashMap::new()),
        Synthesizer::new(llm.clone(), true),
        persistence,
        llm,
        config,
        HashMap::new(),
    );

    Harness {
        dispatcher: Arc::new(dispatcher),
    }
}
