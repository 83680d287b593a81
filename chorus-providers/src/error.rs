//! Error types for the provider layer.
//!
//! Every failure an adapter can surface is classified into one of five kinds
//! (`ErrorKind`) that the refinement controller routes on: transport, auth,
//! rate-limited, timeout, provider-internal. The richer `ProviderError`
//! variants preserve context for logging and persistence; `kind()` collapses
//! them to the routing taxonomy.

use std::time::Duration;
use thiserror::Error;

/// Coarse classification of provider failures used by the refinement
/// controller and dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network-level failure reaching the provider; retryable.
    Transport,
    /// Credential or authorization problem; never retried.
    Auth,
    /// Provider-signalled throttling; retryable after the suggested window.
    RateLimited,
    /// The call exceeded its deadline; retryable.
    Timeout,
    /// The provider accepted the call but failed internally.
    ProviderInternal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProviderInternal => "provider_internal",
        }
    }
}

/// Errors surfaced by provider adapters and the local LLM client.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Network or transport failure reaching a provider
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Credential or authorization failure
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Provider-signalled throttling, optionally with a suggested wait
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    /// The call did not complete within its deadline
    #[error("request timed out")]
    Timeout,

    /// Provider-side failure with status code and message
    #[error("provider error: {code} - {message}")]
    ProviderInternal { code: u16, message: String },

    /// Response body could not be decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing adapter configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl ProviderError {
    /// Collapse this error to the five-kind routing taxonomy.
    ///
    /// Serialization and configuration problems count as provider-internal:
    /// the provider answered, but not in a usable way.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Transport { .. } => ErrorKind::Transport,
            ProviderError::Auth { .. } => ErrorKind::Auth,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
            ProviderError::Timeout => ErrorKind::Timeout,
            ProviderError::ProviderInternal { .. }
            | ProviderError::Serialization(_)
            | ProviderError::Configuration { .. } => ErrorKind::ProviderInternal,
        }
    }

    /// Whether a retry within the same refinement attempt is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::RateLimited
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Transport {
                message: err.to_string(),
            }
        }
    }
}
