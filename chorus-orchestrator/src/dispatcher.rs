//! The fan-out executor.
//!
//! One `execute` call runs a prompt across a set of providers in one of four
//! modes, each per-provider task owning a session token and a refinement
//! controller, then funnels the surviving answers through analysis and
//! synthesis and flushes every record to the store before returning.
//!
//! `execute` never returns an error: per-provider failures live in their
//! response records, and callers inspect `responses[provider].status`.

use chorus_providers::{ExpectedSchema, LlmGenerator, OutputFormat, ProviderAdapter, ProviderId};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::analysis::ResponseAnalyzer;
use crate::persistence::PersistenceLayer;
use crate::records::{
    AttemptRecord, ExecutionMode, ExecutionRecord, RequestRecord, ResponseRecord, ResponseStatus,
    ERROR_QUEUED_REJECTED,
};
use crate::refinement::{RefinementController, RefinementRule};
use crate::sessions::{AcquireError, CallOutcome, LoadMetric, SessionRegistry};
use crate::shaping::{PromptShaper, ShapedPrompt};
use crate::synthesis::Synthesizer;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub default_mode: ExecutionMode,
    /// Per-provider queue size = multiplier x max_concurrent.
    pub queue_multiplier: u32,
    /// Pause between load-balanced picks.
    pub pacing_delay: Duration,
    /// How often a task re-checks a session that reported WouldBlock.
    pub acquire_retry_interval: Duration,
    pub default_quality_threshold: f64,
    pub default_max_refinements: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_mode: ExecutionMode::Parallel,
            queue_multiplier: 2,
            pacing_delay: Duration::from_millis(500),
            acquire_retry_interval: Duration::from_millis(50),
            default_quality_threshold: 0.8,
            default_max_refinements: 5,
        }
    }
}

/// One execution request as callers hand it in.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub providers: Vec<ProviderId>,
    pub expected_output: ExpectedSchema,
    pub format: OutputFormat,
    /// Defaults to the dispatcher's configured mode.
    pub mode: Option<ExecutionMode>,
    /// 1..5; clamped.
    pub priority: u8,
    pub quality_threshold: Option<f64>,
    pub max_refinements: Option<u32>,
    /// Wall-clock budget for the whole execution.
    pub deadline: Duration,
}

impl ExecuteRequest {
    pub fn new(
        prompt: impl Into<String>,
        providers: Vec<ProviderId>,
        expected_output: ExpectedSchema,
        format: OutputFormat,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            providers,
            expected_output,
            format,
            mode: None,
            priority: 3,
            quality_threshold: None,
            max_refinements: None,
            deadline: Duration::from_secs(120),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    pub fn with_max_refinements(mut self, max_refinements: u32) -> Self {
        self.max_refinements = Some(max_refinements);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

struct ProviderRun {
    request: Option<RequestRecord>,
    attempts: Vec<AttemptRecord>,
    response: ResponseRecord,
    metric: Option<LoadMetric>,
}

impl ProviderRun {
    fn failed(provider: ProviderId, error: &str) -> Self {
        let mut response = ResponseRecord::new("", provider);
        response.fail(error);
        Self {
            request: None,
            attempts: Vec::new(),
            response,
            metric: None,
        }
    }
}

struct ExecContext<'a> {
    schema: &'a ExpectedSchema,
    format: OutputFormat,
    quality_threshold: f64,
    max_refinements: u32,
    deadline_at: Instant,
    cancel: &'a CancellationToken,
}

/// Runs executions. Built once, shared by every caller.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    shaper: Arc<PromptShaper>,
    rules: Arc<Vec<RefinementRule>>,
    analyzer: ResponseAnalyzer,
    synthesizer: Synthesizer,
    persistence: Arc<PersistenceLayer>,
    llm: Option<Arc<dyn LlmGenerator>>,
    config: DispatcherConfig,
    min_intervals: HashMap<ProviderId, Duration>,
    queues: HashMap<ProviderId, Arc<Semaphore>>,
    queue_capacities: HashMap<ProviderId, u32>,
    last_call: Mutex<HashMap<ProviderId, Instant>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
        shaper: Arc<PromptShaper>,
        rules: Arc<Vec<RefinementRule>>,
        analyzer: ResponseAnalyzer,
        synthesizer: Synthesizer,
        persistence: Arc<PersistenceLayer>,
        llm: Option<Arc<dyn LlmGenerator>>,
        config: DispatcherConfig,
        min_intervals: HashMap<ProviderId, Duration>,
    ) -> Self {
        let mut queues = HashMap::new();
        let mut queue_capacities = HashMap::new();
        for provider in adapters.keys() {
            let max_concurrent = registry
                .snapshot(*provider)
                .map(|s| s.max_concurrent)
                .unwrap_or_else(|| provider.default_max_concurrent());
            let capacity = (max_concurrent * config.queue_multiplier.max(1)).max(1);
            queues.insert(*provider, Arc::new(Semaphore::new(capacity as usize)));
            queue_capacities.insert(*provider, capacity);
        }

        Self {
            registry,
            adapters,
            shaper,
            rules,
            analyzer,
            synthesizer,
            persistence,
            llm,
            config,
            min_intervals,
            queues,
            queue_capacities,
            last_call: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn persistence(&self) -> &Arc<PersistenceLayer> {
        &self.persistence
    }

    /// Run one execution to completion. Never errors; inspect the record.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecutionRecord {
        let cancel = CancellationToken::new();
        self.execute_with_cancellation(request, &cancel).await
    }

    /// Like [`execute`](Self::execute), with an external cancellation
    /// handle. Cancelling fails every still-running provider and returns.
    pub async fn execute_with_cancellation(
        &self,
        request: ExecuteRequest,
        cancel: &CancellationToken,
    ) -> ExecutionRecord {
        let started = std::time::Instant::now();
        let deadline_at = Instant::now() + request.deadline;
        let mode = request.mode.unwrap_or(self.config.default_mode);
        let priority = request.priority.clamp(1, 5);
        let quality_threshold = request
            .quality_threshold
            .unwrap_or(self.config.default_quality_threshold)
            .clamp(0.0, 1.0);
        let max_refinements = request
            .max_refinements
            .unwrap_or(self.config.default_max_refinements)
            .clamp(1, 10);

        let mut execution = ExecutionRecord::new(
            request.prompt.clone(),
            request.providers.clone(),
            mode,
            request.expected_output.clone(),
            request.format,
            priority,
        );

        let available: Vec<ProviderId> = self
            .registry
            .available(&request.providers)
            .into_iter()
            .filter(|provider| self.adapters.contains_key(provider))
            .collect();

        tracing::info!(
            execution_id = %execution.execution_id,
            mode = mode.as_str(),
            requested = request.providers.len(),
            available = available.len(),
            "starting execution"
        );

        let runs = if available.is_empty() {
            tracing::warn!(execution_id = %execution.execution_id, "no available providers");
            Vec::new()
        } else {
            let strategy = self
                .shaper
                .strategy_for(self.shaper.classify(&request.prompt));
            let shaped = self.shaper.shape_for_providers(
                &request.prompt,
                &available,
                &request.expected_output,
                request.format,
                strategy,
            );
            let ctx = ExecContext {
                schema: &request.expected_output,
                format: request.format,
                quality_threshold,
                max_refinements,
                deadline_at,
                cancel,
            };
            match mode {
                ExecutionMode::Parallel => self.run_parallel(&available, &shaped, &ctx).await,
                ExecutionMode::Sequential => self.run_sequential(&available, &shaped, &ctx).await,
                ExecutionMode::PriorityBased => {
                    self.run_priority_based(&available, &shaped, &ctx, priority).await
                }
                ExecutionMode::LoadBalanced => {
                    self.run_load_balanced(&available, &shaped, &ctx).await
                }
            }
        };

        let mut requests = Vec::new();
        let mut attempts = Vec::new();
        let mut metrics = Vec::new();
        let attempted = runs.len();
        for run in runs {
            if let Some(request_record) = run.request {
                requests.push(request_record);
            }
            attempts.extend(run.attempts);
            if let Some(metric) = run.metric {
                metrics.push(metric);
            }
            execution.responses.insert(run.response.provider, run.response);
        }

        let completed: Vec<&ResponseRecord> = execution
            .responses
            .values()
            .filter(|r| r.status == ResponseStatus::Completed)
            .collect();
        execution.success_rate = if attempted == 0 {
            0.0
        } else {
            completed.len() as f64 / attempted as f64
        };

        let mut answers = Vec::with_capacity(completed.len());
        for response in completed {
            answers.push(self.analyzer.analyze(response).await);
        }
        let synthesis = self
            .synthesizer
            .synthesize(&answers, &request.prompt, None)
            .await;
        execution.synthesis = Some(synthesis);
        execution.completed_at = Some(Utc::now());
        execution.execution_time_seconds = started.elapsed().as_secs_f64();

        if let Err(err) = self.persist(&execution, &requests, &attempts, &metrics).await {
            tracing::error!(
                execution_id = %execution.execution_id,
                "failed to persist execution records: {err}"
            );
            execution.persistence_degraded = true;
        }

        tracing::info!(
            execution_id = %execution.execution_id,
            success_rate = execution.success_rate,
            elapsed = execution.execution_time_seconds,
            "execution finished"
        );
        execution
    }

    async fn run_parallel(
        &self,
        providers: &[ProviderId],
        shaped: &std::collections::BTreeMap<ProviderId, ShapedPrompt>,
        ctx: &ExecContext<'_>,
    ) -> Vec<ProviderRun> {
        join_all(
            providers
                .iter()
                .map(|&provider| self.run_one(provider, &shaped[&provider].text, ctx)),
        )
        .await
    }

    /// Providers ordered by ascending mean response time, one at a time.
    async fn run_sequential(
        &self,
        providers: &[ProviderId],
        shaped: &std::collections::BTreeMap<ProviderId, ShapedPrompt>,
        ctx: &ExecContext<'_>,
    ) -> Vec<ProviderRun> {
        let mut ordered: Vec<ProviderId> = providers.to_vec();
        ordered.sort_by(|a, b| {
            let latency = |p: &ProviderId| {
                self.registry
                    .snapshot(*p)
                    .map(|s| s.average_response_time)
                    .unwrap_or(0.0)
            };
            latency(a)
                .partial_cmp(&latency(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut runs = Vec::with_capacity(ordered.len());
        for provider in ordered {
            runs.push(self.run_one(provider, &shaped[&provider].text, ctx).await);
        }
        runs
    }

    /// Three tiers by computed per-call priority; each lower tier only runs
    /// if nothing so far meets the quality bar.
    async fn run_priority_based(
        &self,
        providers: &[ProviderId],
        shaped: &std::collections::BTreeMap<ProviderId, ShapedPrompt>,
        ctx: &ExecContext<'_>,
        base_priority: u8,
    ) -> Vec<ProviderRun> {
        let mut high = Vec::new();
        let mut medium = Vec::new();
        let mut low = Vec::new();
        for &provider in providers {
            match self.call_priority(provider, base_priority) {
                p if p >= 4 => high.push(provider),
                p if p >= 2 => medium.push(provider),
                _ => low.push(provider),
            }
        }

        let mut runs = Vec::new();
        for tier in [high, medium, low] {
            if tier.is_empty() {
                continue;
            }
            if !runs.is_empty() && self.meets_threshold(&runs, ctx.quality_threshold) {
                break;
            }
            let tier_runs = self.run_parallel(&tier, shaped, ctx).await;
            runs.extend(tier_runs);
        }
        runs
    }

    /// Repeatedly pick the best available provider by composite score until
    /// every provider has run, pacing between picks.
    async fn run_load_balanced(
        &self,
        providers: &[ProviderId],
        shaped: &std::collections::BTreeMap<ProviderId, ShapedPrompt>,
        ctx: &ExecContext<'_>,
    ) -> Vec<ProviderRun> {
        let mut remaining: Vec<ProviderId> = providers.to_vec();
        let mut runs = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            if Instant::now() >= ctx.deadline_at || ctx.cancel.is_cancelled() {
                for provider in remaining.drain(..) {
                    runs.push(ProviderRun::failed(provider, "timeout"));
                }
                break;
            }

            match self.select_best_available(&remaining) {
                Some(provider) => {
                    tracing::debug!(provider = %provider, "load-balanced pick");
                    runs.push(self.run_one(provider, &shaped[&provider].text, ctx).await);
                    remaining.retain(|p| *p != provider);
                    if !remaining.is_empty() && !self.config.pacing_delay.is_zero() {
                        tokio::time::sleep(self.config.pacing_delay).await;
                    }
                }
                None => {
                    // Everything is at capacity; give sessions a moment.
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
        runs
    }

    /// One provider task bounded by the execution deadline and cancellation.
    /// Dropping the inner future releases the session token.
    async fn run_one(
        &self,
        provider: ProviderId,
        prompt: &str,
        ctx: &ExecContext<'_>,
    ) -> ProviderRun {
        tokio::select! {
            run = self.provider_task(provider, prompt, ctx) => run,
            _ = ctx.cancel.cancelled() => {
                tracing::warn!(provider = %provider, "provider task cancelled");
                ProviderRun::failed(provider, "timeout")
            }
            _ = tokio::time::sleep_until(ctx.deadline_at) => {
                tracing::warn!(provider = %provider, "execution deadline hit");
                ProviderRun::failed(provider, "timeout")
            }
        }
    }

    async fn provider_task(
        &self,
        provider: ProviderId,
        prompt: &str,
        ctx: &ExecContext<'_>,
    ) -> ProviderRun {
        let Some(adapter) = self.adapters.get(&provider) else {
            return ProviderRun::failed(provider, "provider_internal");
        };

        // Back-pressure: a full queue rejects instead of blocking.
        let Some(queue) = self.queues.get(&provider) else {
            return ProviderRun::failed(provider, "provider_internal");
        };
        let Ok(_permit) = Arc::clone(queue).try_acquire_owned() else {
            tracing::warn!(provider = %provider, "provider queue full, rejecting task");
            return ProviderRun::failed(provider, ERROR_QUEUED_REJECTED);
        };

        self.pace(provider).await;

        // Acquisitions never block; poll until a slot frees or the
        // deadline passes.
        let token = loop {
            match self.registry.acquire(provider) {
                Ok(token) => break token,
                Err(AcquireError::NotRegistered) => {
                    return ProviderRun::failed(provider, "provider_internal");
                }
                Err(AcquireError::WouldBlock) => {
                    if Instant::now() >= ctx.deadline_at {
                        return ProviderRun::failed(provider, "timeout");
                    }
                    tokio::time::sleep(self.config.acquire_retry_interval).await;
                }
            }
        };

        let controller = RefinementController::new(
            Arc::clone(adapter),
            Arc::clone(&self.shaper),
            Arc::clone(&self.rules),
            self.llm.clone(),
        );
        let remaining = ctx.deadline_at.saturating_duration_since(Instant::now());
        let task_started = std::time::Instant::now();
        let outcome = controller
            .run(
                prompt,
                ctx.schema,
                ctx.format,
                ctx.quality_threshold,
                ctx.max_refinements,
                remaining,
            )
            .await;

        let success = outcome.response.status == ResponseStatus::Completed;
        let response_time = outcome
            .response
            .response_time
            .unwrap_or_else(|| task_started.elapsed().as_secs_f64());
        let mut metric = self.registry.release(
            token,
            CallOutcome {
                success,
                response_time,
            },
        );
        metric.queue_length = self.queue_depth(provider);

        ProviderRun {
            request: Some(outcome.request),
            attempts: outcome.attempts,
            response: outcome.response,
            metric: Some(metric),
        }
    }

    /// Sleep out the per-provider minimum inter-request interval.
    async fn pace(&self, provider: ProviderId) {
        let interval = self
            .min_intervals
            .get(&provider)
            .copied()
            .unwrap_or(Duration::ZERO);
        if interval.is_zero() {
            return;
        }

        let wait = {
            let last_call = self.last_call.lock().expect("last_call mutex poisoned");
            last_call
                .get(&provider)
                .map(|last| (*last + interval).saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO)
        };
        if !wait.is_zero() {
            tracing::debug!(provider = %provider, wait_ms = wait.as_millis() as u64, "rate limit pacing");
            tokio::time::sleep(wait).await;
        }
        self.last_call
            .lock()
            .expect("last_call mutex poisoned")
            .insert(provider, Instant::now());
    }

    /// Base priority adjusted by success rate, latency and load, clamped to
    /// 1..5.
    fn call_priority(&self, provider: ProviderId, base_priority: u8) -> u8 {
        let Some(session) = self.registry.snapshot(provider) else {
            return base_priority.clamp(1, 5);
        };
        let mut priority = base_priority as i32;

        let success_rate = session.success_rate();
        if success_rate > 0.8 {
            priority += 1;
        } else if success_rate < 0.5 {
            priority -= 1;
        }

        if session.average_response_time < 3.0 {
            priority += 1;
        } else if session.average_response_time > 10.0 {
            priority -= 1;
        }

        let load = session.load_factor();
        if load < 0.5 {
            priority += 1;
        } else if load > 0.8 {
            priority -= 1;
        }

        priority.clamp(1, 5) as u8
    }

    /// Composite score over the currently available subset:
    /// 0.3 x (1 - load) + 0.3 x 1/(1 + latency) + 0.2 x success + 0.2 x capacity.
    fn select_best_available(&self, providers: &[ProviderId]) -> Option<ProviderId> {
        let available = self.registry.available(providers);
        let mut best: Option<(ProviderId, f64)> = None;
        for provider in available {
            let Some(session) = self.registry.snapshot(provider) else {
                continue;
            };
            let load_factor = session.load_factor();
            let score = 0.3 * (1.0 - load_factor)
                + 0.3 * (1.0 / (1.0 + session.average_response_time))
                + 0.2 * session.success_rate()
                + 0.2 * (1.0 - load_factor);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((provider, score)),
            }
        }
        best.map(|(provider, _)| provider)
    }

    fn meets_threshold(&self, runs: &[ProviderRun], threshold: f64) -> bool {
        runs.iter().any(|run| {
            run.response.status == ResponseStatus::Completed
                && run.response.quality_score >= threshold
        })
    }

    fn queue_depth(&self, provider: ProviderId) -> u32 {
        let capacity = self.queue_capacities.get(&provider).copied().unwrap_or(0);
        let available = self
            .queues
            .get(&provider)
            .map(|q| q.available_permits() as u32)
            .unwrap_or(capacity);
        capacity.saturating_sub(available)
    }

    async fn persist(
        &self,
        execution: &ExecutionRecord,
        requests: &[RequestRecord],
        attempts: &[AttemptRecord],
        metrics: &[LoadMetric],
    ) -> Result<(), crate::error::PersistenceError> {
        self.persistence
            .record_execution(execution, requests, attempts)
            .await?;
        for metric in metrics {
            self.persistence.record_load_metric(metric).await?;
        }
        for provider in execution.responses.keys() {
            if let Some(session) = self.registry.snapshot(*provider) {
                self.persistence.upsert_session(&session).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinement::default_rules;
    use chorus_providers::{Completion, ProviderError};

    struct StaticAdapter {
        provider: ProviderId,
        text: String,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for StaticAdapter {
        fn provider(&self) -> ProviderId {
            self.provider
        }

        async fn send(
            &self,
            _prompt: &str,
            deadline: Duration,
        ) -> Result<Completion, ProviderError> {
            if self.delay > deadline {
                tokio::time::sleep(deadline).await;
                return Err(ProviderError::Timeout);
            }
            tokio::time::sleep(self.delay).await;
            Ok(Completion {
                text: self.text.clone(),
                latency: self.delay,
            })
        }
    }

    fn good_json() -> String {
        format!(
            "{{\"colors\": [\"red\", \"green\", \"blue\"], \"note\": \"{}\"}}",
            "red, green and blue are the standard additive primaries. ".repeat(4)
        )
    }

    async fn dispatcher_with(
        adapters: Vec<StaticAdapter>,
        config: DispatcherConfig,
    ) -> Dispatcher {
        let registry = Arc::new(SessionRegistry::new());
        let mut adapter_map: HashMap<ProviderId, Arc<dyn ProviderAdapter>> = HashMap::new();
        for adapter in adapters {
            registry.register(adapter.provider, 2, serde_json::json!({}));
            adapter_map.insert(adapter.provider, Arc::new(adapter));
        }
        let persistence = Arc::new(PersistenceLayer::open_in_memory().await.unwrap());
        Dispatcher::new(
            registry,
            adapter_map,
            Arc::new(PromptShaper::new()),
            Arc::new(default_rules()),
            ResponseAnalyzer::new(None, HashMap::new()),
            Synthesizer::new(None, true),
            persistence,
            None,
            config,
            HashMap::new(),
        )
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            pacing_delay: Duration::from_millis(1),
            acquire_retry_interval: Duration::from_millis(5),
            ..DispatcherConfig::default()
        }
    }

    fn colors_request() -> ExecuteRequest {
        ExecuteRequest::new(
            "list three primary colors",
            vec![ProviderId::Claude, ProviderId::Gemini],
            ExpectedSchema::structured([("colors", Some("[]"))]),
            OutputFormat::Json,
        )
        .with_quality_threshold(0.8)
        .with_max_refinements(3)
        .with_deadline(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn parallel_execution_completes_all_providers() {
        let dispatcher = dispatcher_with(
            vec![
                StaticAdapter {
                    provider: ProviderId::Claude,
                    text: good_json(),
                    delay: Duration::from_millis(5),
                },
                StaticAdapter {
                    provider: ProviderId::Gemini,
                    text: good_json(),
                    delay: Duration::from_millis(5),
                },
            ],
            fast_config(),
        )
        .await;

        let record = dispatcher
            .execute(colors_request().with_mode(ExecutionMode::Parallel))
            .await;
        assert_eq!(record.responses.len(), 2);
        assert!((record.success_rate - 1.0).abs() < 1e-9);
        for response in record.responses.values() {
            assert_eq!(response.status, ResponseStatus::Completed);
        }
        let synthesis = record.synthesis.unwrap();
        let contribution_sum: f64 = synthesis.contributions.values().sum();
        assert!((contribution_sum - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unavailable_providers_are_skipped() {
        let dispatcher = dispatcher_with(
            vec![StaticAdapter {
                provider: ProviderId::Claude,
                text: good_json(),
                delay: Duration::from_millis(5),
            }],
            fast_config(),
        )
        .await;
        dispatcher.registry().mark_error(ProviderId::Claude);

        let record = dispatcher.execute(colors_request()).await;
        assert!(record.responses.is_empty());
        assert_eq!(record.success_rate, 0.0);
        let synthesis = record.synthesis.unwrap();
        assert!(synthesis.synthesized_text.contains("No successful responses"));
        assert!(synthesis.contributions.is_empty());
    }

    #[tokio::test]
    async fn deadline_is_honoured_and_sessions_recover() {
        let dispatcher = dispatcher_with(
            vec![StaticAdapter {
                provider: ProviderId::Claude,
                text: good_json(),
                delay: Duration::from_secs(10),
            }],
            fast_config(),
        )
        .await;

        let started = std::time::Instant::now();
        let record = dispatcher
            .execute(
                ExecuteRequest::new(
                    "slow question",
                    vec![ProviderId::Claude],
                    ExpectedSchema::structured([("colors", Some("[]"))]),
                    OutputFormat::Json,
                )
                .with_max_refinements(3)
                .with_deadline(Duration::from_secs(2)),
            )
            .await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(1800));
        assert!(elapsed <= Duration::from_millis(2500));
        let response = &record.responses[&ProviderId::Claude];
        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(response.error.as_deref(), Some("timeout"));

        let session = dispatcher
            .registry()
            .snapshot(ProviderId::Claude)
            .unwrap();
        assert_eq!(session.current_load, 0);
        assert_ne!(session.state, crate::sessions::SessionState::Busy);
    }

    #[tokio::test]
    async fn sequential_mode_orders_by_mean_latency() {
        let dispatcher = dispatcher_with(
            vec![
                StaticAdapter {
                    provider: ProviderId::Claude,
                    text: good_json(),
                    delay: Duration::from_millis(5),
                },
                StaticAdapter {
                    provider: ProviderId::Gemini,
                    text: good_json(),
                    delay: Duration::from_millis(5),
                },
            ],
            fast_config(),
        )
        .await;

        // Seed latency history: Gemini is far slower.
        for (provider, seconds) in [(ProviderId::Claude, 0.5), (ProviderId::Gemini, 9.0)] {
            let token = dispatcher.registry().acquire(provider).unwrap();
            dispatcher.registry().release(
                token,
                CallOutcome {
                    success: true,
                    response_time: seconds,
                },
            );
        }

        let record = dispatcher
            .execute(colors_request().with_mode(ExecutionMode::Sequential))
            .await;
        assert_eq!(record.responses.len(), 2);
        let claude = &record.responses[&ProviderId::Claude];
        let gemini = &record.responses[&ProviderId::Gemini];
        assert!(claude.timestamp <= gemini.timestamp);
    }

    #[tokio::test]
    async fn cancellation_fails_outstanding_providers() {
        let dispatcher = dispatcher_with(
            vec![StaticAdapter {
                provider: ProviderId::Claude,
                text: good_json(),
                delay: Duration::from_secs(30),
            }],
            fast_config(),
        )
        .await;

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let record = dispatcher
            .execute_with_cancellation(
                ExecuteRequest::new(
                    "question",
                    vec![ProviderId::Claude],
                    ExpectedSchema::structured([("colors", Some("[]"))]),
                    OutputFormat::Json,
                )
                .with_deadline(Duration::from_secs(60)),
                &cancel,
            )
            .await;

        let response = &record.responses[&ProviderId::Claude];
        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(
            dispatcher
                .registry()
                .snapshot(ProviderId::Claude)
                .unwrap()
                .current_load,
            0
        );
    }

    #[tokio::test]
    async fn load_balanced_picks_best_scored_provider_first() {
        let dispatcher = dispatcher_with(
            vec![
                StaticAdapter {
                    provider: ProviderId::Claude,
                    text: good_json(),
                    delay: Duration::from_millis(5),
                },
                StaticAdapter {
                    provider: ProviderId::Gemini,
                    text: good_json(),
                    delay: Duration::from_millis(5),
                },
                StaticAdapter {
                    provider: ProviderId::Perplexity,
                    text: good_json(),
                    delay: Duration::from_millis(5),
                },
            ],
            fast_config(),
        )
        .await;

        // Seed stats: Claude 1s / all successes, Gemini 5s, Perplexity 15s
        // with failures.
        let seed = [
            (ProviderId::Claude, 1.0, true),
            (ProviderId::Gemini, 5.0, true),
            (ProviderId::Perplexity, 15.0, false),
        ];
        for (provider, seconds, success) in seed {
            let token = dispatcher.registry().acquire(provider).unwrap();
            dispatcher.registry().release(
                token,
                CallOutcome {
                    success,
                    response_time: seconds,
                },
            );
        }

        let record = dispatcher
            .execute(
                ExecuteRequest::new(
                    "question",
                    vec![
                        ProviderId::Perplexity,
                        ProviderId::Gemini,
                        ProviderId::Claude,
                    ],
                    ExpectedSchema::structured([("colors", Some("[]"))]),
                    OutputFormat::Json,
                )
                .with_mode(ExecutionMode::LoadBalanced)
                .with_quality_threshold(0.8)
                .with_deadline(Duration::from_secs(20)),
            )
            .await;

        assert_eq!(record.responses.len(), 3);
        // Picks are sequential in score order, so completion timestamps
        // follow Claude, Gemini, Perplexity.
        let claude = record.responses[&ProviderId::Claude].timestamp;
        let gemini = record.responses[&ProviderId::Gemini].timestamp;
        let perplexity = record.responses[&ProviderId::Perplexity].timestamp;
        assert!(claude <= gemini);
        assert!(gemini <= perplexity);
    }

    #[tokio::test]
    async fn priority_mode_stops_after_quality_met_in_high_tier() {
        let dispatcher = dispatcher_with(
            vec![
                StaticAdapter {
                    provider: ProviderId::Claude,
                    text: good_json(),
                    delay: Duration::from_millis(5),
                },
                StaticAdapter {
                    provider: ProviderId::Gemini,
                    text: good_json(),
                    delay: Duration::from_millis(5),
                },
            ],
            fast_config(),
        )
        .await;

        // Claude gets a strong history (high tier); Gemini a weak, slow one
        // (low tier).
        let token = dispatcher.registry().acquire(ProviderId::Claude).unwrap();
        dispatcher.registry().release(
            token,
            CallOutcome {
                success: true,
                response_time: 0.5,
            },
        );
        for _ in 0..3 {
            let token = dispatcher.registry().acquire(ProviderId::Gemini).unwrap();
            dispatcher.registry().release(
                token,
                CallOutcome {
                    success: false,
                    response_time: 20.0,
                },
            );
        }

        let record = dispatcher
            .execute(
                colors_request()
                    .with_mode(ExecutionMode::PriorityBased)
                    .with_priority(3),
            )
            .await;

        // The high tier satisfied the bar; the weak provider never ran.
        assert!(record.responses.contains_key(&ProviderId::Claude));
        assert!(!record.responses.contains_key(&ProviderId::Gemini));
        assert_eq!(
            record.responses[&ProviderId::Claude].status,
            ResponseStatus::Completed
        );
    }

    #[tokio::test]
    async fn queue_overflow_rejects_instead_of_blocking() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register(ProviderId::Claude, 1, serde_json::json!({}));
        let mut adapter_map: HashMap<ProviderId, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapter_map.insert(
            ProviderId::Claude,
            Arc::new(StaticAdapter {
                provider: ProviderId::Claude,
                text: good_json(),
                delay: Duration::from_millis(300),
            }),
        );
        let persistence = Arc::new(PersistenceLayer::open_in_memory().await.unwrap());
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            adapter_map,
            Arc::new(PromptShaper::new()),
            Arc::new(default_rules()),
            ResponseAnalyzer::new(None, HashMap::new()),
            Synthesizer::new(None, true),
            persistence,
            None,
            DispatcherConfig {
                queue_multiplier: 1,
                ..fast_config()
            },
            HashMap::new(),
        ));

        // Queue capacity is 1; the burst overflows it.
        let mut handles = Vec::new();
        for _ in 0..4 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                dispatcher
                    .execute(
                        ExecuteRequest::new(
                            "question",
                            vec![ProviderId::Claude],
                            ExpectedSchema::structured([("colors", Some("[]"))]),
                            OutputFormat::Json,
                        )
                        .with_quality_threshold(0.8)
                        .with_max_refinements(1)
                        .with_deadline(Duration::from_secs(10)),
                    )
                    .await
            }));
        }

        let mut rejected = 0;
        let mut completed = 0;
        for handle in handles {
            let record = handle.await.unwrap();
            match record.responses.get(&ProviderId::Claude) {
                Some(r) if r.status == ResponseStatus::Completed => completed += 1,
                Some(r) if r.error.as_deref() == Some(ERROR_QUEUED_REJECTED) => rejected += 1,
                _ => {}
            }
        }
        assert!(completed >= 1);
        assert!(rejected >= 1);
    }

    #[tokio::test]
    async fn records_are_persisted_before_return() {
        let dispatcher = dispatcher_with(
            vec![StaticAdapter {
                provider: ProviderId::Claude,
                text: good_json(),
                delay: Duration::from_millis(5),
            }],
            fast_config(),
        )
        .await;

        let record = dispatcher.execute(colors_request()).await;
        assert!(!record.persistence_degraded);

        let stats = dispatcher.persistence().refinement_statistics().await.unwrap();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.total_requests, 1);
    }
}
