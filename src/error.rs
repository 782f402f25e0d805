//! Error taxonomy for the executor core.
//!
//! Errors are split by concern: construction-time validation
//! ([`ConfigError`]), local container operations ([`PileError`]), event
//! state transitions ([`EventError`]) and upstream call outcomes
//! ([`CallError`]). Upstream errors travel as values through the retry
//! policy, which pattern-matches on the kind to decide retry vs. fail.

use std::time::Duration;

use thiserror::Error;

/// Invalid construction arguments. Raised before any work starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("queue capacity must be greater than 0")]
    ZeroQueueCapacity,

    #[error("capacity refresh time must be larger than 0, got {0}s")]
    NonPositiveRefreshTime(f64),

    #[error("replenish interval must be larger than 0, got {0}s")]
    NonPositiveInterval(f64),

    #[error("max_retries must be at least 1")]
    ZeroMaxRetries,

    #[error("concurrency limit must be greater than 0")]
    ZeroConcurrencyLimit,

    #[error("journal flush capacity must be greater than 0")]
    ZeroJournalCapacity,

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Local errors from id-keyed container operations.
#[derive(Debug, Error)]
pub enum PileError {
    #[error("no item with id {0}")]
    NotFound(crate::id::Id),

    #[error("item with id {0} already present")]
    AlreadyExists(crate::id::Id),

    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("corrupt snapshot: {0}")]
    Snapshot(String),
}

/// Illegal event status transition.
///
/// The status machine is a DAG; once terminal, an event never moves again.
#[derive(Debug, Error)]
#[error("illegal status transition {from:?} -> {to:?}")]
pub struct EventError {
    pub from: crate::event::EventStatus,
    pub to: crate::event::EventStatus,
}

/// Upstream call outcomes the retry policy interprets.
///
/// | Kind | Retry policy |
/// |------|--------------|
/// | `RateLimited` | backoff, or the server's `Retry-After` hint |
/// | `ExceedsBudget` | terminal, the request can never be admitted |
/// | `QuotaExhausted` | terminal, retrying cannot help |
/// | `Server` (5xx) | backoff |
/// | `Http` (other non-2xx) | backoff until retries run out |
/// | `Transport` | backoff until retries run out |
/// | `RetryExhausted` | terminal wrapper around the last cause |
/// | `Cancelled` | propagated to the caller |
#[derive(Debug, Error)]
pub enum CallError {
    #[error("rate limit exceeded (requested_tokens: {requested_tokens:?})")]
    RateLimited {
        requested_tokens: Option<u64>,
        /// Server-provided wait hint from a `Retry-After` header.
        retry_after: Option<Duration>,
    },

    #[error("request of {requested_tokens} tokens exceeds the token budget of {limit_tokens}")]
    ExceedsBudget {
        requested_tokens: u64,
        limit_tokens: u64,
    },

    #[error("quota exhausted: {message}")]
    QuotaExhausted { message: String },

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<CallError>,
    },

    #[error("cancelled")]
    Cancelled,
}

impl CallError {
    /// Whether the retry policy may schedule another attempt for this kind.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::RateLimited { .. }
            | CallError::Server { .. }
            | CallError::Http { .. }
            | CallError::Transport(_) => true,
            CallError::ExceedsBudget { .. }
            | CallError::QuotaExhausted { .. }
            | CallError::RetryExhausted { .. }
            | CallError::Cancelled => false,
        }
    }
}
