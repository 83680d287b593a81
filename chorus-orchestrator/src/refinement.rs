//! The per-request refinement loop.
//!
//! For one (provider, prompt, expected-schema) triple the controller drives:
//! send, validate, and — while quality stays under the threshold — classify
//! the dominant failure, pick a refinement rule, reshape the prompt and try
//! again, up to the attempt cap or the deadline.
//!
//! Decisions per (request, attempt) are a pure function of the validator
//! output, the rule table and the stats snapshot the controller was built
//! with, so concurrent requests always see consistent rule behavior.
//! Historical stats only change between executions, via the persistence
//! layer.

use chorus_providers::{
    ErrorKind, ExpectedSchema, GenerateRequest, LlmGenerator, OutputFormat, ProviderAdapter,
    ProviderError, ProviderId,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::records::{AttemptRecord, RequestRecord, ResponseRecord};
use crate::shaping::PromptShaper;
use crate::validation::{Issue, OutputValidator};

/// Failure class diagnosed from a validation report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementTrigger {
    FormatMismatch,
    MissingFields,
    InvalidData,
    IncompleteResponse,
    StructureError,
    ContentMismatch,
}

impl RefinementTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefinementTrigger::FormatMismatch => "format_mismatch",
            RefinementTrigger::MissingFields => "missing_fields",
            RefinementTrigger::InvalidData => "invalid_data",
            RefinementTrigger::IncompleteResponse => "incomplete_response",
            RefinementTrigger::StructureError => "structure_error",
            RefinementTrigger::ContentMismatch => "content_mismatch",
        }
    }
}

impl std::str::FromStr for RefinementTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "format_mismatch" => Ok(RefinementTrigger::FormatMismatch),
            "missing_fields" => Ok(RefinementTrigger::MissingFields),
            "invalid_data" => Ok(RefinementTrigger::InvalidData),
            "incomplete_response" => Ok(RefinementTrigger::IncompleteResponse),
            "structure_error" => Ok(RefinementTrigger::StructureError),
            "content_mismatch" => Ok(RefinementTrigger::ContentMismatch),
            other => Err(format!("unknown refinement trigger: {other}")),
        }
    }
}

/// Strategy applied when rewriting a failed prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementAction {
    ClarifyFormat,
    RequestMissingData,
    FixStructure,
    ProvideExamples,
    SimplifyRequest,
    SplitRequest,
}

impl RefinementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefinementAction::ClarifyFormat => "clarify_format",
            RefinementAction::RequestMissingData => "request_missing_data",
            RefinementAction::FixStructure => "fix_structure",
            RefinementAction::ProvideExamples => "provide_examples",
            RefinementAction::SimplifyRequest => "simplify_request",
            RefinementAction::SplitRequest => "split_request",
        }
    }
}

impl std::str::FromStr for RefinementAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clarify_format" => Ok(RefinementAction::ClarifyFormat),
            "request_missing_data" => Ok(RefinementAction::RequestMissingData),
            "fix_structure" => Ok(RefinementAction::FixStructure),
            "provide_examples" => Ok(RefinementAction::ProvideExamples),
            "simplify_request" => Ok(RefinementAction::SimplifyRequest),
            "split_request" => Ok(RefinementAction::SplitRequest),
            other => Err(format!("unknown refinement action: {other}")),
        }
    }
}

/// One entry of the rule table mapping failure classes to actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementRule {
    pub id: String,
    pub trigger: RefinementTrigger,
    /// Restrict the rule to one provider; `None` applies everywhere.
    pub provider: Option<ProviderId>,
    pub action: RefinementAction,
    /// 1..5, higher wins.
    pub priority: u8,
    /// Highest attempt number this rule still applies to.
    pub max_attempts: u32,
    /// Historical success rate; tie-breaker among equal priorities.
    pub success_rate: f64,
}

/// The rule table that ships by default. Extended at configuration time and
/// re-weighted from persisted history between executions.
pub fn default_rules() -> Vec<RefinementRule> {
    vec![
        RefinementRule {
            id: "format_json_fix".to_string(),
            trigger: RefinementTrigger::FormatMismatch,
            provider: None,
            action: RefinementAction::ClarifyFormat,
            priority: 5,
            max_attempts: 3,
            success_rate: 0.8,
        },
        RefinementRule {
            id: "missing_fields_request".to_string(),
            trigger: RefinementTrigger::MissingFields,
            provider: None,
            action: RefinementAction::RequestMissingData,
            priority: 4,
            max_attempts: 2,
            success_rate: 0.7,
        },
        RefinementRule {
            id: "incomplete_example".to_string(),
            trigger: RefinementTrigger::IncompleteResponse,
            provider: None,
            action: RefinementAction::ProvideExamples,
            priority: 3,
            max_attempts: 2,
            success_rate: 0.6,
        },
        RefinementRule {
            id: "claude_structure_fix".to_string(),
            trigger: RefinementTrigger::StructureError,
            provider: Some(ProviderId::Claude),
            action: RefinementAction::FixStructure,
            priority: 4,
            max_attempts: 2,
            success_rate: 0.75,
        },
    ]
}

/// Pick the dominant trigger from an issue list: most frequent wins, ties
/// go to the earliest occurrence. Empty lists default to content mismatch.
pub fn dominant_trigger(issues: &[Issue]) -> RefinementTrigger {
    let mut counts: Vec<(RefinementTrigger, usize, usize)> = Vec::new();
    for (index, issue) in issues.iter().enumerate() {
        match counts.iter_mut().find(|(t, _, _)| *t == issue.trigger) {
            Some(entry) => entry.1 += 1,
            None => counts.push((issue.trigger, 1, index)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    counts
        .first()
        .map(|(trigger, _, _)| *trigger)
        .unwrap_or(RefinementTrigger::ContentMismatch)
}

/// Select the refinement action for (trigger, provider, attempt):
/// matching rules sorted by priority, then historical success rate, then id
/// for a stable order; if none matches, fall back by attempt number.
pub fn select_action(
    rules: &[RefinementRule],
    trigger: RefinementTrigger,
    provider: ProviderId,
    attempt_number: u32,
) -> RefinementAction {
    let mut candidates: Vec<&RefinementRule> = rules
        .iter()
        .filter(|rule| {
            rule.trigger == trigger
                && rule.provider.map_or(true, |p| p == provider)
                && attempt_number <= rule.max_attempts
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(
                b.success_rate
                    .partial_cmp(&a.success_rate)
                    .unwrap_or(Ordering::Equal),
            )
            .then(a.id.cmp(&b.id))
    });

    match candidates.first() {
        Some(rule) => rule.action,
        None => match attempt_number {
            1 => RefinementAction::ClarifyFormat,
            2 => RefinementAction::ProvideExamples,
            _ => RefinementAction::SimplifyRequest,
        },
    }
}

/// Everything one controller run produced.
#[derive(Debug)]
pub struct ControllerOutcome {
    pub request: RequestRecord,
    pub response: ResponseRecord,
    pub attempts: Vec<AttemptRecord>,
}

/// Drives the refinement loop for one provider within one execution.
pub struct RefinementController {
    adapter: Arc<dyn ProviderAdapter>,
    shaper: Arc<PromptShaper>,
    validator: OutputValidator,
    rules: Arc<Vec<RefinementRule>>,
    llm: Option<Arc<dyn LlmGenerator>>,
}

impl RefinementController {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        shaper: Arc<PromptShaper>,
        rules: Arc<Vec<RefinementRule>>,
        llm: Option<Arc<dyn LlmGenerator>>,
    ) -> Self {
        Self {
            adapter,
            shaper,
            validator: OutputValidator::new(),
            rules,
            llm,
        }
    }

    /// Run the loop until the quality threshold is met, the attempt cap is
    /// reached, the deadline expires, or a fatal error aborts it.
    pub async fn run(
        &self,
        shaped_prompt: &str,
        schema: &ExpectedSchema,
        format: OutputFormat,
        quality_threshold: f64,
        max_refinements: u32,
        deadline: Duration,
    ) -> ControllerOutcome {
        let provider = self.adapter.provider();
        let max_refinements = max_refinements.max(1);
        let request = RequestRecord::new(
            provider,
            shaped_prompt,
            schema.clone(),
            format,
            vec![format!("quality >= {quality_threshold:.2}")],
            max_refinements,
        );
        let mut response = ResponseRecord::new(&request.request_id, provider);
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        let started = Instant::now();
        let mut current_prompt = shaped_prompt.to_string();
        let mut previous_quality = 0.0_f64;

        for attempt in 1..=max_refinements {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                response.refinement_count = attempts.len() as u32;
                response.fail(ErrorKind::Timeout.as_str());
                break;
            }
            // Split what is left of the deadline evenly across the attempts
            // that may still run.
            let attempt_deadline = remaining / (max_refinements - attempt + 1);
            response.mark_processing();

            match self.adapter.send(&current_prompt, attempt_deadline).await {
                Ok(completion) => {
                    let report = self.validator.validate(&completion.text, schema, format);
                    tracing::debug!(
                        provider = %provider,
                        attempt,
                        quality = report.quality_score,
                        "validated provider answer"
                    );

                    if report.quality_score >= quality_threshold {
                        response.refinement_count = attempts.len() as u32;
                        response.complete(
                            completion.text,
                            report.parsed_value,
                            report.quality_score,
                            completion.latency.as_secs_f64(),
                        );
                        break;
                    }

                    if attempt == max_refinements {
                        response.raw_text = completion.text;
                        response.parsed_value = report.parsed_value;
                        response.quality_score = report.quality_score;
                        response.response_time = Some(completion.latency.as_secs_f64());
                        response.refinement_count = attempts.len() as u32;
                        response.fail("quality_threshold_not_met");
                        break;
                    }

                    let trigger = dominant_trigger(&report.issues);
                    let action = select_action(&self.rules, trigger, provider, attempt);
                    let issue_details: Vec<String> =
                        report.issues.iter().map(|i| i.detail.clone()).collect();

                    let example = if action == RefinementAction::ProvideExamples {
                        self.generate_example(schema, format).await
                    } else {
                        None
                    };
                    let simplified = if matches!(
                        action,
                        RefinementAction::SimplifyRequest | RefinementAction::SplitRequest
                    ) {
                        self.simplify_prompt(&request.prompt).await
                    } else {
                        None
                    };

                    let refinement_prompt = self.shaper.refinement_prompt(
                        action,
                        &request.prompt,
                        &completion.text,
                        &issue_details,
                        schema,
                        format,
                        example.as_deref(),
                        simplified.as_deref(),
                    );
                    let expected_fix = self.shaper.expected_fix(action, &issue_details);
                    let improved = report.quality_score > previous_quality;

                    attempts.push(AttemptRecord::new(
                        &request.request_id,
                        attempt,
                        trigger,
                        &refinement_prompt,
                        expected_fix,
                        snippet(&completion.text, 200),
                        improved,
                        report.quality_score,
                    ));

                    previous_quality = report.quality_score;
                    current_prompt = refinement_prompt;
                    response.mark_refinement_needed();
                }
                Err(err) => {
                    let kind = err.kind();
                    if kind == ErrorKind::Auth {
                        tracing::warn!(provider = %provider, "auth failure, aborting controller: {err}");
                        response.refinement_count = attempts.len() as u32;
                        response.fail(kind.as_str());
                        break;
                    }

                    // Respect a provider-suggested throttle window before the
                    // next attempt, bounded by what is left of the deadline.
                    if let ProviderError::RateLimited {
                        retry_after: Some(window),
                    } = &err
                    {
                        let pause = (*window).min(deadline.saturating_sub(started.elapsed()));
                        if !pause.is_zero() {
                            tokio::time::sleep(pause).await;
                        }
                    }

                    if attempt == max_refinements {
                        response.refinement_count = attempts.len() as u32;
                        response.fail(kind.as_str());
                        break;
                    }

                    // Transport-class failures count as an attempt and are
                    // routed as a synthetic incomplete-response issue.
                    let trigger = RefinementTrigger::IncompleteResponse;
                    let action = select_action(&self.rules, trigger, provider, attempt);
                    let issue_details = vec![format!("no usable response received: {err}")];
                    let refinement_prompt = self.shaper.refinement_prompt(
                        action,
                        &request.prompt,
                        "",
                        &issue_details,
                        schema,
                        format,
                        None,
                        None,
                    );
                    let expected_fix = self.shaper.expected_fix(action, &issue_details);

                    attempts.push(AttemptRecord::new(
                        &request.request_id,
                        attempt,
                        trigger,
                        &refinement_prompt,
                        expected_fix,
                        "",
                        false,
                        0.0,
                    ));
                    current_prompt = refinement_prompt;
                    response.mark_refinement_needed();
                }
            }
        }

        if !response.status.is_terminal() {
            response.refinement_count = attempts.len() as u32;
            response.fail(ErrorKind::Timeout.as_str());
        }

        ControllerOutcome {
            request,
            response,
            attempts,
        }
    }

    /// Ask the local model for a realistic example of the expected output.
    /// Falls back to `None` so the template renders the schema itself.
    async fn generate_example(
        &self,
        schema: &ExpectedSchema,
        format: OutputFormat,
    ) -> Option<String> {
        let llm = self.llm.as_ref()?;
        let prompt = format!(
            "Create a realistic example that matches this structure:\n{}\n\n\
The example should demonstrate the exact format needed.",
            schema.render(format)
        );
        match llm
            .generate(
                GenerateRequest::new(prompt)
                    .with_system(
                        "You are an expert at creating examples. Provide only the example, no explanations.",
                    )
                    .with_max_tokens(400)
                    .with_temperature(0.3),
            )
            .await
        {
            Ok(generation) if !generation.text.is_empty() => Some(generation.text),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!("example generation failed, using schema fallback: {err}");
                None
            }
        }
    }

    /// Ask the local model for a simpler rendition of the original prompt.
    async fn simplify_prompt(&self, original: &str) -> Option<String> {
        let llm = self.llm.as_ref()?;
        let prompt = format!(
            "Simplify this prompt to make it clearer and more direct:\n\n\
ORIGINAL: {original}\n\n\
Make it concise, clear in intent, and specific.\n\nSimplified version:"
        );
        match llm
            .generate(
                GenerateRequest::new(prompt)
                    .with_system("You are an expert at simplifying prompts. Be concise and clear.")
                    .with_max_tokens(300)
                    .with_temperature(0.3),
            )
            .await
        {
            Ok(generation) if !generation.text.is_empty() => Some(generation.text),
            _ => None,
        }
    }
}

fn snippet(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
