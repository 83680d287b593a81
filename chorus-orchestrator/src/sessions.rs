//! Per-provider session state and the registry that owns it.
//!
//! Exactly one session exists per (process, provider). Every mutation runs
//! inside that session's own mutex and the critical sections are purely
//! synchronous, so a lock is never held across an await point. `acquire`
//! never blocks: it either hands out a token or reports `WouldBlock`, and
//! back-pressure is the dispatcher's problem.
//!
//! Tokens release on every exit path. An explicit `release` records the
//! call outcome and updates the rolling stats; if the token is dropped
//! instead (cancellation, panic), the load count still comes back down.

use chorus_providers::ProviderId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Lifecycle state of one provider session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Inactive,
    Active,
    Busy,
    Error,
    Maintenance,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Inactive => "inactive",
            SessionState::Active => "active",
            SessionState::Busy => "busy",
            SessionState::Error => "error",
            SessionState::Maintenance => "maintenance",
        }
    }
}

/// Mutable per-provider session state. Lives behind its per-entry mutex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSession {
    pub provider: ProviderId,
    pub state: SessionState,
    pub last_activity: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Rolling EMA of response time, in seconds.
    pub average_response_time: f64,
    pub current_load: u32,
    pub max_concurrent: u32,
    /// Opaque adapter-provided session blob.
    pub session_data: serde_json::Value,
    /// Samples folded into the EMA so far; the smoothing window caps at 50.
    pub(crate) sample_count: u64,
}

impl ProviderSession {
    fn new(provider: ProviderId, max_concurrent: u32, session_data: serde_json::Value) -> Self {
        Self {
            provider,
            state: SessionState::Active,
            last_activity: Utc::now(),
            total_requests: 0,
            successful_requests: 0,
            average_response_time: 0.0,
            current_load: 0,
            max_concurrent: max_concurrent.max(1),
            session_data,
            sample_count: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    pub fn load_factor(&self) -> f64 {
        self.current_load as f64 / self.max_concurrent as f64
    }
}

/// Point-in-time load snapshot for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadMetric {
    pub provider: ProviderId,
    pub queue_length: u32,
    pub average_response_time: f64,
    pub success_rate: f64,
    pub load_factor: f64,
    pub capacity_score: f64,
    pub timestamp: DateTime<Utc>,
}

/// How a finished provider call went; folded into the session stats.
#[derive(Debug, Clone, Copy)]
pub struct CallOutcome {
    pub success: bool,
    /// Wall-clock seconds the call took.
    pub response_time: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
    /// The session is at its concurrency cap or not in an acquirable state.
    #[error("provider is at capacity or unavailable")]
    WouldBlock,
    /// No session was registered for this provider.
    #[error("provider is not registered")]
    NotRegistered,
}

/// Permit for one in-flight call against a provider session.
///
/// Dropping the token without an explicit release still decrements the load
/// counter, so cancellation and panics cannot leak capacity.
#[derive(Debug)]
pub struct SessionToken {
    session: Arc<Mutex<ProviderSession>>,
    provider: ProviderId,
    released: bool,
}

impl SessionToken {
    pub fn provider(&self) -> ProviderId {
        self.provider
    }
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        if !self.released {
            let mut session = self.session.lock().expect("session mutex poisoned");
            decrement_load(&mut session);
        }
    }
}

fn decrement_load(session: &mut ProviderSession) {
    session.current_load = session.current_load.saturating_sub(1);
    session.last_activity = Utc::now();
    if session.state == SessionState::Busy && session.current_load < session.max_concurrent {
        session.state = SessionState::Active;
    }
}

/// Owns every provider session in this process. Never a global: whoever
/// builds the dispatcher builds (and shares) the registry.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ProviderId, Arc<Mutex<ProviderSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register (or replace) the session for a provider.
    pub fn register(
        &self,
        provider: ProviderId,
        max_concurrent: u32,
        session_data: serde_json::Value,
    ) {
        let session = ProviderSession::new(provider, max_concurrent, session_data);
        tracing::info!(
            provider = %provider,
            max_concurrent = session.max_concurrent,
            "provider session registered"
        );
        self.sessions
            .insert(provider, Arc::new(Mutex::new(session)));
    }

    /// Restore a previously persisted session, keeping its counters but
    /// resetting transient load.
    pub fn restore(&self, mut session: ProviderSession) {
        session.current_load = 0;
        if session.state == SessionState::Busy {
            session.state = SessionState::Active;
        }
        self.sessions
            .insert(session.provider, Arc::new(Mutex::new(session)));
    }

    /// Atomically check capacity and take a load slot.
    pub fn acquire(&self, provider: ProviderId) -> Result<SessionToken, AcquireError> {
        let entry = self
            .sessions
            .get(&provider)
            .ok_or(AcquireError::NotRegistered)?;
        let session_arc = Arc::clone(entry.value());
        drop(entry);

        let mut session = session_arc.lock().expect("session mutex poisoned");
        if session.state != SessionState::Active || session.current_load >= session.max_concurrent
        {
            return Err(AcquireError::WouldBlock);
        }
        session.current_load += 1;
        session.total_requests += 1;
        session.last_activity = Utc::now();
        if session.current_load >= session.max_concurrent {
            session.state = SessionState::Busy;
        }
        drop(session);

        Ok(SessionToken {
            session: session_arc,
            provider,
            released: false,
        })
    }

    /// Release a token, fold the outcome into the rolling stats, and return
    /// the fresh load snapshot for persistence.
    pub fn release(&self, mut token: SessionToken, outcome: CallOutcome) -> LoadMetric {
        let metric = {
            let mut session = token.session.lock().expect("session mutex poisoned");
            decrement_load(&mut session);
            if outcome.success {
                session.successful_requests += 1;
            }

            // EMA with alpha = 2/(n+1), n capped at 50 samples.
            session.sample_count += 1;
            let n = session.sample_count.min(50);
            let alpha = 2.0 / (n as f64 + 1.0);
            session.average_response_time =
                alpha * outcome.response_time + (1.0 - alpha) * session.average_response_time;

            snapshot_metric(&session, 0)
        };
        token.released = true;
        metric
    }

    /// Subset of `providers` that are registered, active, and below cap.
    pub fn available(&self, providers: &[ProviderId]) -> Vec<ProviderId> {
        providers
            .iter()
            .copied()
            .filter(|provider| {
                self.sessions
                    .get(provider)
                    .map(|entry| {
                        let session = entry.value().lock().expect("session mutex poisoned");
                        session.state == SessionState::Active
                            && session.current_load < session.max_concurrent
                    })
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Clone of the current session state, if registered.
    pub fn snapshot(&self, provider: ProviderId) -> Option<ProviderSession> {
        self.sessions.get(&provider).map(|entry| {
            entry
                .value()
                .lock()
                .expect("session mutex poisoned")
                .clone()
        })
    }

    /// Current load metric, with the queue depth supplied by the caller.
    pub fn load_metric(&self, provider: ProviderId, queue_length: u32) -> Option<LoadMetric> {
        self.sessions.get(&provider).map(|entry| {
            let session = entry.value().lock().expect("session mutex poisoned");
            snapshot_metric(&session, queue_length)
        })
    }

    /// Force a session into a given lifecycle state (maintenance windows,
    /// error quarantine).
    pub fn set_state(&self, provider: ProviderId, state: SessionState) {
        if let Some(entry) = self.sessions.get(&provider) {
            let mut session = entry.value().lock().expect("session mutex poisoned");
            session.state = state;
            session.last_activity = Utc::now();
        }
    }

    /// Quarantine a session after an unrecoverable failure.
    pub fn mark_error(&self, provider: ProviderId) {
        tracing::warn!(provider = %provider, "session moved to error state");
        self.set_state(provider, SessionState::Error);
    }

    pub fn registered_providers(&self) -> Vec<ProviderId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }
}

fn snapshot_metric(session: &ProviderSession, queue_length: u32) -> LoadMetric {
    let load_factor = session.load_factor();
    LoadMetric {
        provider: session.provider,
        queue_length,
        average_response_time: session.average_response_time,
        success_rate: session.success_rate(),
        load_factor,
        capacity_score: 1.0 - load_factor,
        timestamp: Utc::now(),
    }
}
