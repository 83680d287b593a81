//! Single embedded record store for the whole orchestrator.
//!
//! One SQLite database holds every table: sessions and rules are upserts,
//! everything else (executions, requests, attempts, responses, load
//! metrics) is append-only. Components receive a shared handle instead of
//! opening their own files, which is what makes the immutability and
//! ordering invariants enforceable in one place.
//!
//! A completed execution's records are flushed before the execution is
//! reported complete; analytics queries are read-only and may run
//! concurrently with writes.

use chorus_providers::ProviderId;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::records::{AttemptRecord, ExecutionRecord, RequestRecord};
use crate::refinement::{RefinementAction, RefinementRule, RefinementTrigger};
use crate::sessions::{LoadMetric, ProviderSession, SessionState};

/// Aggregate refinement analytics across all persisted executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementStatistics {
    pub total_executions: u64,
    pub total_requests: u64,
    /// Requests that needed at least one refinement.
    pub refined_requests: u64,
    pub average_refinements: f64,
    /// Fraction of responses that completed successfully.
    pub success_rate: f64,
    /// Trigger name -> frequency, most common first.
    pub common_triggers: Vec<(String, u64)>,
}

/// Per-provider response analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPerformance {
    pub provider: ProviderId,
    pub responses: u64,
    pub completed: u64,
    pub average_quality: f64,
    pub average_response_time: f64,
}

/// Process-local record store backed by one SQLite database.
pub struct PersistenceLayer {
    conn: Connection,
    process_id: String,
}

impl PersistenceLayer {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path.as_ref().to_path_buf()).await?;
        let layer = Self {
            conn,
            process_id: Uuid::new_v4().to_string(),
        };
        layer.init_schema().await?;
        Ok(layer)
    }

    pub async fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().await?;
        let layer = Self {
            conn,
            process_id: Uuid::new_v4().to_string(),
        };
        layer.init_schema().await?;
        Ok(layer)
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    async fn init_schema(&self) -> Result<(), PersistenceError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS provider_sessions (
                        process_id TEXT NOT NULL,
                        provider TEXT NOT NULL,
                        state TEXT NOT NULL,
                        last_activity TEXT NOT NULL,
                        total_requests INTEGER NOT NULL,
                        successful_requests INTEGER NOT NULL,
                        average_response_time REAL NOT NULL,
                        current_load INTEGER NOT NULL,
                        max_concurrent INTEGER NOT NULL,
                        sample_count INTEGER NOT NULL,
                        session_data TEXT NOT NULL,
                        PRIMARY KEY (process_id, provider)
                    );
                    CREATE TABLE IF NOT EXISTS executions (
                        execution_id TEXT PRIMARY KEY,
                        original_prompt TEXT NOT NULL,
                        target_providers TEXT NOT NULL,
                        execution_mode TEXT NOT NULL,
                        expected_output TEXT NOT NULL,
                        format TEXT NOT NULL,
                        priority INTEGER NOT NULL,
                        created_at TEXT NOT NULL,
                        completed_at TEXT,
                        execution_time REAL NOT NULL,
                        success_rate REAL NOT NULL,
                        results_summary TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS requests (
                        request_id TEXT PRIMARY KEY,
                        execution_id TEXT NOT NULL,
                        provider TEXT NOT NULL,
                        prompt TEXT NOT NULL,
                        expected_schema TEXT NOT NULL,
                        format TEXT NOT NULL,
                        refinement_criteria TEXT NOT NULL,
                        max_refinements INTEGER NOT NULL,
                        created_at TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS attempts (
                        attempt_id TEXT PRIMARY KEY,
                        request_id TEXT NOT NULL,
                        refinement_number INTEGER NOT NULL,
                        trigger_reason TEXT NOT NULL,
                        refinement_prompt TEXT NOT NULL,
                        expected_fix TEXT NOT NULL,
                        response_snippet TEXT NOT NULL,
                        success INTEGER NOT NULL,
                        quality_score REAL NOT NULL,
                        timestamp TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS responses (
                        response_id TEXT PRIMARY KEY,
                        request_id TEXT NOT NULL,
                        execution_id TEXT NOT NULL,
                        provider TEXT NOT NULL,
                        raw_text TEXT NOT NULL,
                        parsed_value TEXT,
                        status TEXT NOT NULL,
                        refinement_count INTEGER NOT NULL,
                        quality_score REAL NOT NULL,
                        response_time REAL,
                        error TEXT,
                        timestamp TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS load_metrics (
                        metric_id TEXT PRIMARY KEY,
                        provider TEXT NOT NULL,
                        queue_length INTEGER NOT NULL,
                        response_time REAL NOT NULL,
                        success_rate REAL NOT NULL,
                        load_factor REAL NOT NULL,
                        capacity_score REAL NOT NULL,
                        timestamp TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS rules (
                        rule_id TEXT PRIMARY KEY,
                        trigger_reason TEXT NOT NULL,
                        provider TEXT,
                        action TEXT NOT NULL,
                        priority INTEGER NOT NULL,
                        max_attempts INTEGER NOT NULL,
                        success_rate REAL NOT NULL,
                        updated_at TEXT NOT NULL
                    );",
                )?;
                Ok(())
            })
            .await
            .map_err(PersistenceError::from)
    }

    /// Persist a finished execution with its requests, attempts and
    /// responses, all in one transaction.
    pub async fn record_execution(
        &self,
        execution: &ExecutionRecord,
        requests: &[RequestRecord],
        attempts: &[AttemptRecord],
    ) -> Result<(), PersistenceError> {
        let execution_id = execution.execution_id.clone();
        let original_prompt = execution.original_prompt.clone();
        let target_providers = serde_json::to_string(
            &execution
                .target_providers
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>(),
        )?;
        let mode = execution.execution_mode.as_str().to_string();
        let expected_output = serde_json::to_string(&execution.expected_output)?;
        let format = execution.format.as_str().to_string();
        let priority = execution.priority as i64;
        let created_at = execution.created_at.to_rfc3339();
        let completed_at = execution.completed_at.map(|t| t.to_rfc3339());
        let execution_time = execution.execution_time_seconds;
        let success_rate = execution.success_rate;
        let results_summary = serde_json::to_string(
            &execution
                .responses
                .iter()
                .map(|(provider, response)| (provider.as_str(), response.quality_score))
                .collect::<Vec<_>>(),
        )?;

        struct RequestRow {
            request_id: String,
            provider: String,
            prompt: String,
            expected_schema: String,
            format: String,
            refinement_criteria: String,
            max_refinements: i64,
            created_at: String,
        }
        let request_rows: Vec<RequestRow> = requests
            .iter()
            .map(|r| {
                Ok(RequestRow {
                    request_id: r.request_id.clone(),
                    provider: r.provider.as_str().to_string(),
                    prompt: r.prompt.clone(),
                    expected_schema: serde_json::to_string(&r.expected_schema)?,
                    format: r.format.as_str().to_string(),
                    refinement_criteria: serde_json::to_string(&r.refinement_criteria)?,
                    max_refinements: r.max_refinements as i64,
                    created_at: r.created_at.to_rfc3339(),
                })
            })
            .collect::<Result<_, PersistenceError>>()?;

        struct AttemptRow {
            attempt_id: String,
            request_id: String,
            refinement_number: i64,
            trigger: String,
            refinement_prompt: String,
            expected_fix: String,
            response_snippet: String,
            success: bool,
            quality_score: f64,
            timestamp: String,
        }
        let attempt_rows: Vec<AttemptRow> = attempts
            .iter()
            .map(|a| AttemptRow {
                attempt_id: a.attempt_id.clone(),
                request_id: a.request_id.clone(),
                refinement_number: a.refinement_number as i64,
                trigger: a.trigger.as_str().to_string(),
                refinement_prompt: a.refinement_prompt.clone(),
                expected_fix: a.expected_fix.clone(),
                response_snippet: a.response_snippet.clone(),
                success: a.success,
                quality_score: a.quality_score,
                timestamp: a.timestamp.to_rfc3339(),
            })
            .collect();

        struct ResponseRow {
            response_id: String,
            request_id: String,
            provider: String,
            raw_text: String,
            parsed_value: Option<String>,
            status: String,
            refinement_count: i64,
            quality_score: f64,
            response_time: Option<f64>,
            error: Option<String>,
            timestamp: String,
        }
        let response_rows: Vec<ResponseRow> = execution
            .responses
            .values()
            .map(|r| {
                Ok(ResponseRow {
                    response_id: r.response_id.clone(),
                    request_id: r.request_id.clone(),
                    provider: r.provider.as_str().to_string(),
                    raw_text: r.raw_text.clone(),
                    parsed_value: r
                        .parsed_value
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    status: r.status.as_str().to_string(),
                    refinement_count: r.refinement_count as i64,
                    quality_score: r.quality_score,
                    response_time: r.response_time,
                    error: r.error.clone(),
                    timestamp: r.timestamp.to_rfc3339(),
                })
            })
            .collect::<Result<_, PersistenceError>>()?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO executions
                     (execution_id, original_prompt, target_providers, execution_mode,
                      expected_output, format, priority, created_at, completed_at,
                      execution_time, success_rate, results_summary)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        execution_id,
                        original_prompt,
                        target_providers,
                        mode,
                        expected_output,
                        format,
                        priority,
                        created_at,
                        completed_at,
                        execution_time,
                        success_rate,
                        results_summary,
                    ],
                )?;

                for row in &request_rows {
                    tx.execute(
                        "INSERT INTO requests
                         (request_id, execution_id, provider, prompt, expected_schema,
                          format, refinement_criteria, max_refinements, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            row.request_id,
                            execution_id,
                            row.provider,
                            row.prompt,
                            row.expected_schema,
                            row.format,
                            row.refinement_criteria,
                            row.max_refinements,
                            row.created_at,
                        ],
                    )?;
                }

                for row in &attempt_rows {
                    tx.execute(
                        "INSERT INTO attempts
                         (attempt_id, request_id, refinement_number, trigger_reason,
                          refinement_prompt, expected_fix, response_snippet, success,
                          quality_score, timestamp)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            row.attempt_id,
                            row.request_id,
                            row.refinement_number,
                            row.trigger,
                            row.refinement_prompt,
                            row.expected_fix,
                            row.response_snippet,
                            row.success,
                            row.quality_score,
                            row.timestamp,
                        ],
                    )?;
                }

                for row in &response_rows {
                    tx.execute(
                        "INSERT INTO responses
                         (response_id, request_id, execution_id, provider, raw_text,
                          parsed_value, status, refinement_count, quality_score,
                          response_time, error, timestamp)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        params![
                            row.response_id,
                            row.request_id,
                            execution_id,
                            row.provider,
                            row.raw_text,
                            row.parsed_value,
                            row.status,
                            row.refinement_count,
                            row.quality_score,
                            row.response_time,
                            row.error,
                            row.timestamp,
                        ],
                    )?;
                }

                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(PersistenceError::from)
    }

    /// Upsert the session row for (process, provider).
    pub async fn upsert_session(
        &self,
        session: &ProviderSession,
    ) -> Result<(), PersistenceError> {
        let process_id = self.process_id.clone();
        let provider = session.provider.as_str().to_string();
        let state = session.state.as_str().to_string();
        let last_activity = session.last_activity.to_rfc3339();
        let total_requests = session.total_requests as i64;
        let successful_requests = session.successful_requests as i64;
        let average_response_time = session.average_response_time;
        let current_load = session.current_load as i64;
        let max_concurrent = session.max_concurrent as i64;
        let sample_count = session.sample_count as i64;
        let session_data = serde_json::to_string(&session.session_data)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO provider_sessions
                     (process_id, provider, state, last_activity, total_requests,
                      successful_requests, average_response_time, current_load,
                      max_concurrent, sample_count, session_data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        process_id,
                        provider,
                        state,
                        last_activity,
                        total_requests,
                        successful_requests,
                        average_response_time,
                        current_load,
                        max_concurrent,
                        sample_count,
                        session_data,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(PersistenceError::from)
    }

    /// Load every session persisted by this process.
    pub async fn load_sessions(&self) -> Result<Vec<ProviderSession>, PersistenceError> {
        let process_id = self.process_id.clone();
        let rows: Vec<(
            String,
            String,
            String,
            i64,
            i64,
            f64,
            i64,
            i64,
            i64,
            String,
        )> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT provider, state, last_activity, total_requests,
                            successful_requests, average_response_time, current_load,
                            max_concurrent, sample_count, session_data
                     FROM provider_sessions WHERE process_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![process_id], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for (
            provider,
            state,
            last_activity,
            total_requests,
            successful_requests,
            average_response_time,
            current_load,
            max_concurrent,
            sample_count,
            session_data,
        ) in rows
        {
            let Ok(provider) = ProviderId::from_str(&provider) else {
                continue;
            };
            sessions.push(ProviderSession {
                provider,
                state: parse_state(&state),
                last_activity: parse_timestamp(&last_activity),
                total_requests: total_requests as u64,
                successful_requests: successful_requests as u64,
                average_response_time,
                current_load: current_load as u32,
                max_concurrent: max_concurrent as u32,
                session_data: serde_json::from_str(&session_data).unwrap_or(serde_json::Value::Null),
                sample_count: sample_count as u64,
            });
        }
        Ok(sessions)
    }

    /// Append one load metric snapshot.
    pub async fn record_load_metric(&self, metric: &LoadMetric) -> Result<(), PersistenceError> {
        let metric_id = Uuid::new_v4().to_string();
        let provider = metric.provider.as_str().to_string();
        let queue_length = metric.queue_length as i64;
        let response_time = metric.average_response_time;
        let success_rate = metric.success_rate;
        let load_factor = metric.load_factor;
        let capacity_score = metric.capacity_score;
        let timestamp = metric.timestamp.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO load_metrics
                     (metric_id, provider, queue_length, response_time, success_rate,
                      load_factor, capacity_score, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        metric_id,
                        provider,
                        queue_length,
                        response_time,
                        success_rate,
                        load_factor,
                        capacity_score,
                        timestamp,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(PersistenceError::from)
    }

    /// Upsert one refinement rule.
    pub async fn upsert_rule(&self, rule: &RefinementRule) -> Result<(), PersistenceError> {
        let rule_id = rule.id.clone();
        let trigger = rule.trigger.as_str().to_string();
        let provider = rule.provider.map(|p| p.as_str().to_string());
        let action = rule.action.as_str().to_string();
        let priority = rule.priority as i64;
        let max_attempts = rule.max_attempts as i64;
        let success_rate = rule.success_rate;
        let updated_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO rules
                     (rule_id, trigger_reason, provider, action, priority, max_attempts,
                      success_rate, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        rule_id,
                        trigger,
                        provider,
                        action,
                        priority,
                        max_attempts,
                        success_rate,
                        updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(PersistenceError::from)
    }

    /// Load the persisted rule table.
    pub async fn load_rules(&self) -> Result<Vec<RefinementRule>, PersistenceError> {
        let rows: Vec<(String, String, Option<String>, String, i64, i64, f64)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT rule_id, trigger_reason, provider, action, priority, max_attempts,
                            success_rate
                     FROM rules ORDER BY priority DESC, rule_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for (id, trigger, provider, action, priority, max_attempts, success_rate) in rows {
            let (Ok(trigger), Ok(action)) = (
                RefinementTrigger::from_str(&trigger),
                RefinementAction::from_str(&action),
            ) else {
                tracing::warn!(rule_id = %id, "skipping rule with unknown trigger or action");
                continue;
            };
            rules.push(RefinementRule {
                id,
                trigger,
                provider: provider.and_then(|p| ProviderId::from_str(&p).ok()),
                action,
                priority: priority.clamp(1, 5) as u8,
                max_attempts: max_attempts.max(1) as u32,
                success_rate,
            });
        }
        Ok(rules)
    }

    /// Aggregate refinement analytics. Read-only.
    pub async fn refinement_statistics(&self) -> Result<RefinementStatistics, PersistenceError> {
        self.conn
            .call(|conn| {
                let total_executions: u64 =
                    conn.query_row("SELECT COUNT(*) FROM executions", [], |row| row.get(0))?;
                let total_requests: u64 =
                    conn.query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))?;
                let (refined_requests, average_refinements): (u64, f64) = conn.query_row(
                    "SELECT COUNT(CASE WHEN refinement_count > 0 THEN 1 END),
                            COALESCE(AVG(refinement_count), 0.0)
                     FROM responses",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let success_rate: f64 = conn.query_row(
                    "SELECT COALESCE(AVG(CASE WHEN status = 'completed' THEN 1.0 ELSE 0.0 END), 0.0)
                     FROM responses",
                    [],
                    |row| row.get(0),
                )?;

                let mut stmt = conn.prepare(
                    "SELECT trigger_reason, COUNT(*) AS frequency
                     FROM attempts GROUP BY trigger_reason ORDER BY frequency DESC LIMIT 5",
                )?;
                let common_triggers = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(RefinementStatistics {
                    total_executions,
                    total_requests,
                    refined_requests,
                    average_refinements,
                    success_rate,
                    common_triggers,
                })
            })
            .await
            .map_err(PersistenceError::from)
    }

    /// Per-provider response analytics. Read-only.
    pub async fn provider_performance(&self) -> Result<Vec<ProviderPerformance>, PersistenceError> {
        let rows: Vec<(String, u64, u64, f64, f64)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT provider,
                            COUNT(*),
                            COUNT(CASE WHEN status = 'completed' THEN 1 END),
                            COALESCE(AVG(quality_score), 0.0),
                            COALESCE(AVG(response_time), 0.0)
                     FROM responses GROUP BY provider ORDER BY provider",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(provider, responses, completed, quality, response_time)| {
                ProviderId::from_str(&provider)
                    .ok()
                    .map(|provider| ProviderPerformance {
                        provider,
                        responses,
                        completed,
                        average_quality: quality,
                        average_response_time: response_time,
                    })
            })
            .collect())
    }
}

fn parse_state(raw: &str) -> SessionState {
    match raw {
        "inactive" => SessionState::Inactive,
        "active" => SessionState::Active,
        "busy" => SessionState::Busy,
        "error" => SessionState::Error,
        "maintenance" => SessionState::Maintenance,
        _ => SessionState::Inactive,
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ExecutionMode, ResponseRecord};
    use crate::refinement::default_rules;
    use chorus_providers::{ExpectedSchema, OutputFormat};

    fn sample_execution() -> (ExecutionRecord, Vec<RequestRecord>, Vec<AttemptRecord>) {
        let schema = ExpectedSchema::structured([("colors", Some("[]"))]);
        let mut execution = ExecutionRecord::new(
            "list three primary colors",
            vec![ProviderId::Claude],
            ExecutionMode::Parallel,
            schema.clone(),
            OutputFormat::Json,
            3,
        );

        let request = RequestRecord::new(
            ProviderId::Claude,
            "shaped prompt",
            schema,
            OutputFormat::Json,
            vec!["quality >= 0.80".into()],
            3,
        );
        let attempt = AttemptRecord::new(
            &request.request_id,
            1,
            RefinementTrigger::FormatMismatch,
            "refined prompt",
            "Correct the output format",
            "Here you go: {}",
            true,
            0.6,
        );

        let mut response = ResponseRecord::new(&request.request_id, ProviderId::Claude);
        response.refinement_count = 1;
        response.complete(
            "{\"colors\": [\"red\",\"green\",\"blue\"]}".into(),
            serde_json::from_str("{\"colors\": [\"red\",\"green\",\"blue\"]}").ok(),
            0.85,
            1.5,
        );
        execution.responses.insert(ProviderId::Claude, response);
        execution.success_rate = 1.0;
        execution.completed_at = Some(Utc::now());

        (execution, vec![request], vec![attempt])
    }

    #[tokio::test]
    async fn execution_round_trips_into_statistics() {
        let store = PersistenceLayer::open_in_memory().await.unwrap();
        let (execution, requests, attempts) = sample_execution();
        store
            .record_execution(&execution, &requests, &attempts)
            .await
            .unwrap();

        let stats = store.refinement_statistics().await.unwrap();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.refined_requests, 1);
        assert!((stats.success_rate - 1.0).abs() < 1e-9);
        assert_eq!(stats.common_triggers[0].0, "format_mismatch");
    }

    #[tokio::test]
    async fn provider_performance_aggregates_by_provider() {
        let store = PersistenceLayer::open_in_memory().await.unwrap();
        let (execution, requests, attempts) = sample_execution();
        store
            .record_execution(&execution, &requests, &attempts)
            .await
            .unwrap();

        let performance = store.provider_performance().await.unwrap();
        assert_eq!(performance.len(), 1);
        assert_eq!(performance[0].provider, ProviderId::Claude);
        assert_eq!(performance[0].completed, 1);
        assert!((performance[0].average_quality - 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sessions_upsert_and_reload() {
        let store = PersistenceLayer::open_in_memory().await.unwrap();
        let registry = crate::sessions::SessionRegistry::new();
        registry.register(ProviderId::Gemini, 2, serde_json::json!({"cookie": "abc"}));

        let token = registry.acquire(ProviderId::Gemini).unwrap();
        registry.release(
            token,
            crate::sessions::CallOutcome {
                success: true,
                response_time: 2.5,
            },
        );

        let snapshot = registry.snapshot(ProviderId::Gemini).unwrap();
        store.upsert_session(&snapshot).await.unwrap();
        // Upsert twice: still one row per (process, provider).
        store.upsert_session(&snapshot).await.unwrap();

        let sessions = store.load_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        let restored = &sessions[0];
        assert_eq!(restored.provider, ProviderId::Gemini);
        assert_eq!(restored.total_requests, 1);
        assert_eq!(restored.successful_requests, 1);
        assert!((restored.average_response_time - 2.5).abs() < 1e-9);
        assert_eq!(restored.session_data["cookie"], "abc");
    }

    #[tokio::test]
    async fn rules_upsert_and_reload() {
        let store = PersistenceLayer::open_in_memory().await.unwrap();
        for rule in default_rules() {
            store.upsert_rule(&rule).await.unwrap();
        }

        let rules = store.load_rules().await.unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].id, "format_json_fix");
        assert_eq!(rules[0].priority, 5);
        let claude_rule = rules
            .iter()
            .find(|r| r.id == "claude_structure_fix")
            .unwrap();
        assert_eq!(claude_rule.provider, Some(ProviderId::Claude));
    }

    #[tokio::test]
    async fn load_metrics_append() {
        let store = PersistenceLayer::open_in_memory().await.unwrap();
        let metric = LoadMetric {
            provider: ProviderId::Local,
            queue_length: 2,
            average_response_time: 0.4,
            success_rate: 0.95,
            load_factor: 0.5,
            capacity_score: 0.5,
            timestamp: Utc::now(),
        };
        store.record_load_metric(&metric).await.unwrap();
        store.record_load_metric(&metric).await.unwrap();

        let count: u64 = store
            .conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM load_metrics", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
