//! Orchestrator-level error types.
//!
//! Per-provider failures never surface as errors from the execution entry
//! point; they are folded into the per-provider response records. The types
//! here cover the failures that are the orchestrator's own: bad
//! configuration (fatal at boot) and record-store trouble (an execution
//! still completes, but is flagged).

use thiserror::Error;

/// Invalid configuration detected at boot. Fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Record-store failure. The affected execution completes but is flagged
/// in-memory so callers may re-issue it.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        PersistenceError::Database(tokio_rusqlite::Error::Rusqlite(err))
    }
}

/// Anything that can stop the orchestrator from coming up.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("adapter setup failed: {0}")]
    Adapter(#[from] chorus_providers::ProviderError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
