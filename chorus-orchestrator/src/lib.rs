//! # Chorus Orchestrator
//!
//! A multi-provider AI orchestrator: one prompt fans out to several
//! conversational-AI providers plus a local LLM, each provider is driven
//! through an iterative refinement loop until its answer conforms to a
//! caller-specified schema, and the surviving answers are fused into a
//! single reply.
//!
//! ## Overview
//!
//! The core is three tightly coupled subsystems:
//!
//! - **Dispatch** ([`dispatcher`]): a parallel / sequential / priority /
//!   load-balanced executor. Every provider owns a session with a
//!   concurrency cap, rate pacing, and rolling performance stats
//!   ([`sessions`]); a full per-provider queue rejects instead of blocking.
//! - **Refinement** ([`refinement`]): a per-request feedback controller
//!   that validates each answer ([`validation`]), diagnoses the failure
//!   class, picks a rule, rewrites the prompt ([`shaping`]) and retries up
//!   to a bound.
//! - **Synthesis** ([`synthesis`]): classifies and scores each answer
//!   ([`analysis`]), detects contradictions, and fuses the survivors with
//!   one of five strategies.
//!
//! Everything that happens is recorded append-only in one embedded store
//! ([`persistence`]) before an execution is reported complete.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use chorus_orchestrator::{bootstrap, ExecuteRequest, OrchestratorConfig};
//! use chorus_providers::{ExpectedSchema, OutputFormat, ProviderId};
//!
//! let config = OrchestratorConfig::load("chorus.toml")?;
//! let dispatcher = bootstrap(config).await?;
//!
//! let record = dispatcher
//!     .execute(ExecuteRequest::new(
//!         "list three primary colors",
//!         vec![ProviderId::Claude, ProviderId::Gemini],
//!         ExpectedSchema::structured([("colors", Some("[]"))]),
//!         OutputFormat::Json,
//!     ))
//!     .await;
//!
//! println!("success rate: {:.0}%", record.success_rate * 100.0);
//! println!("{}", record.synthesis.unwrap().synthesized_text);
//! ```
//!
//! The entry point never errors: per-provider outcomes live in
//! `record.responses[provider].status`, and an execution counts as
//! successful when at least one provider completed and synthesis produced
//! output.

pub mod analysis;
pub mod bootstrap;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod persistence;
pub mod records;
pub mod refinement;
pub mod sessions;
pub mod shaping;
pub mod synthesis;
pub mod validation;

pub use analysis::{AnalyzedAnswer, ContentType, ResponseAnalyzer};
pub use bootstrap::bootstrap;
pub use config::OrchestratorConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig, ExecuteRequest};
pub use error::{BootstrapError, ConfigError, PersistenceError};
pub use persistence::{PersistenceLayer, ProviderPerformance, RefinementStatistics};
pub use records::{
    AttemptRecord, ExecutionMode, ExecutionRecord, RequestRecord, ResponseRecord, ResponseStatus,
};
pub use refinement::{
    default_rules, RefinementAction, RefinementController, RefinementRule, RefinementTrigger,
};
pub use sessions::{CallOutcome, LoadMetric, ProviderSession, SessionRegistry, SessionState};
pub use shaping::{PromptShaper, ShapedPrompt, ShapingStrategy};
pub use synthesis::{SynthesisResult, SynthesisStrategy, Synthesizer};
pub use validation::{OutputValidator, ValidationReport};
