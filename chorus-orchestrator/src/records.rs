//! Execution, request, attempt and response records.
//!
//! Records are created while an execution runs and are append-only once the
//! owning execution completes. A [`ResponseRecord`] enters a terminal state
//! ({completed, failed}) exactly once; the transition methods refuse to
//! mutate a record that is already terminal.

use chorus_providers::{ExpectedSchema, OutputFormat, ProviderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::refinement::RefinementTrigger;
use crate::synthesis::SynthesisResult;

/// Error-kind label for a response that was rejected because the
/// per-provider queue was full.
pub const ERROR_QUEUED_REJECTED: &str = "queued_rejected";

/// How an execution fans out across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
    PriorityBased,
    LoadBalanced,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::PriorityBased => "priority_based",
            ExecutionMode::LoadBalanced => "load_balanced",
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(ExecutionMode::Parallel),
            "sequential" => Ok(ExecutionMode::Sequential),
            "priority_based" => Ok(ExecutionMode::PriorityBased),
            "load_balanced" => Ok(ExecutionMode::LoadBalanced),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// Lifecycle of one per-provider response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Pending,
    Processing,
    Completed,
    RefinementNeeded,
    Failed,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Pending => "pending",
            ResponseStatus::Processing => "processing",
            ResponseStatus::Completed => "completed",
            ResponseStatus::RefinementNeeded => "refinement_needed",
            ResponseStatus::Failed => "failed",
        }
    }

    /// Completed and Failed are terminal; terminal records are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseStatus::Completed | ResponseStatus::Failed)
    }
}

/// One prompt as sent to one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub provider: ProviderId,
    /// Prompt exactly as shaped and sent on attempt one.
    pub prompt: String,
    pub expected_schema: ExpectedSchema,
    pub format: OutputFormat,
    pub refinement_criteria: Vec<String>,
    pub max_refinements: u32,
    pub created_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn new(
        provider: ProviderId,
        prompt: impl Into<String>,
        expected_schema: ExpectedSchema,
        format: OutputFormat,
        refinement_criteria: Vec<String>,
        max_refinements: u32,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            provider,
            prompt: prompt.into(),
            expected_schema,
            format,
            refinement_criteria,
            max_refinements,
            created_at: Utc::now(),
        }
    }
}

/// One refinement attempt within a request. `refinement_number` is 1-based
/// and strictly monotonic per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub request_id: String,
    pub refinement_number: u32,
    pub trigger: RefinementTrigger,
    pub refinement_prompt: String,
    pub expected_fix: String,
    /// Leading slice of the raw response that triggered this refinement.
    pub response_snippet: String,
    pub success: bool,
    pub quality_score: f64,
    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: &str,
        refinement_number: u32,
        trigger: RefinementTrigger,
        refinement_prompt: impl Into<String>,
        expected_fix: impl Into<String>,
        response_snippet: impl Into<String>,
        success: bool,
        quality_score: f64,
    ) -> Self {
        Self {
            attempt_id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            refinement_number,
            trigger,
            refinement_prompt: refinement_prompt.into(),
            expected_fix: expected_fix.into(),
            response_snippet: response_snippet.into(),
            success,
            quality_score,
            timestamp: Utc::now(),
        }
    }
}

/// The final state of one provider's answer within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub response_id: String,
    pub request_id: String,
    pub provider: ProviderId,
    pub raw_text: String,
    pub parsed_value: Option<serde_json::Value>,
    pub status: ResponseStatus,
    pub refinement_count: u32,
    pub quality_score: f64,
    /// Seconds the winning (or last) provider call took, when known.
    pub response_time: Option<f64>,
    /// Error-kind label for failed responses ("timeout", "auth", ...).
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ResponseRecord {
    pub fn new(request_id: &str, provider: ProviderId) -> Self {
        Self {
            response_id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            provider,
            raw_text: String::new(),
            parsed_value: None,
            status: ResponseStatus::Pending,
            refinement_count: 0,
            quality_score: 0.0,
            response_time: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Move a non-terminal record into a working state.
    pub fn mark_processing(&mut self) {
        if !self.status.is_terminal() {
            self.status = ResponseStatus::Processing;
        }
    }

    /// Flag a non-terminal record as awaiting another refinement pass.
    pub fn mark_refinement_needed(&mut self) {
        if !self.status.is_terminal() {
            self.status = ResponseStatus::RefinementNeeded;
        }
    }

    /// Terminal transition into `Completed`. No-op if already terminal.
    pub fn complete(
        &mut self,
        raw_text: String,
        parsed_value: Option<serde_json::Value>,
        quality_score: f64,
        response_time: f64,
    ) {
        if self.status.is_terminal() {
            tracing::warn!(response_id = %self.response_id, "ignoring transition on terminal response");
            return;
        }
        self.raw_text = raw_text;
        self.parsed_value = parsed_value;
        self.quality_score = quality_score.clamp(0.0, 1.0);
        self.response_time = Some(response_time);
        self.status = ResponseStatus::Completed;
        self.timestamp = Utc::now();
    }

    /// Terminal transition into `Failed`. No-op if already terminal.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            tracing::warn!(response_id = %self.response_id, "ignoring transition on terminal response");
            return;
        }
        self.error = Some(error.into());
        self.status = ResponseStatus::Failed;
        self.timestamp = Utc::now();
    }
}

/// One full fan-out across providers, with its per-provider responses and
/// the synthesized reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub original_prompt: String,
    pub target_providers: Vec<ProviderId>,
    pub execution_mode: ExecutionMode,
    pub expected_output: ExpectedSchema,
    pub format: OutputFormat,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_seconds: f64,
    /// completed / attempted, in [0, 1].
    pub success_rate: f64,
    pub responses: BTreeMap<ProviderId, ResponseRecord>,
    pub synthesis: Option<SynthesisResult>,
    /// Set when record-store writes failed; the execution itself is intact.
    pub persistence_degraded: bool,
}

impl ExecutionRecord {
    pub fn new(
        original_prompt: impl Into<String>,
        target_providers: Vec<ProviderId>,
        execution_mode: ExecutionMode,
        expected_output: ExpectedSchema,
        format: OutputFormat,
        priority: u8,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            original_prompt: original_prompt.into(),
            target_providers,
            execution_mode,
            expected_output,
            format,
            priority,
            created_at: Utc::now(),
            completed_at: None,
            execution_time_seconds: 0.0,
            success_rate: 0.0,
            responses: BTreeMap::new(),
            synthesis: None,
            persistence_degraded: false,
        }
    }
}
