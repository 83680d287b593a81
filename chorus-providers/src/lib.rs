//! # Chorus Providers
//!
//! Provider-facing plumbing for the Chorus orchestrator: adapters that carry
//! one prompt to one conversational-AI provider and bring raw text back, the
//! local-LLM client used for synthesis and extraction, and the shared data
//! model and error taxonomy the orchestration core routes on.
//!
//! ## Overview
//!
//! - **Provider adapters**: one [`providers::ProviderAdapter`] per provider
//!   (Claude, Gemini, Perplexity, local), each hiding its transport behind a
//!   single `send(prompt, deadline)` operation.
//! - **Error taxonomy**: every adapter failure collapses to one of five
//!   kinds — transport, auth, rate-limited, timeout, provider-internal —
//!   which is all the refinement controller needs to decide what happens
//!   next.
//! - **Local LLM boundary**: [`local_llm::LlmGenerator`] with an
//!   Ollama-compatible client implementation.
//! - **Data model**: provider identifiers with their reliability weights and
//!   pacing defaults, output formats, and caller-supplied expected schemas.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use chorus_providers::providers::{create_adapter, AdapterConfig};
//! use chorus_providers::ProviderId;
//! use std::time::Duration;
//!
//! let adapter = create_adapter(AdapterConfig::new(ProviderId::Claude, "key"))?;
//! let completion = adapter
//!     .send("list three primary colors", Duration::from_secs(30))
//!     .await?;
//! println!("{} answered in {:?}", adapter.provider(), completion.latency);
//! ```

pub mod common;
pub mod error;
pub mod local_llm;
pub mod models;
pub mod providers;

pub use error::{ErrorKind, ProviderError};
pub use local_llm::{GenerateRequest, Generation, LlmGenerator, LocalLlmClient};
pub use models::{Completion, ExpectedSchema, OutputFormat, ProviderId};
pub use providers::{create_adapter, AdapterConfig, ProviderAdapter};
