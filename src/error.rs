//! Error taxonomy for API request execution.
//!
//! Every fallible operation in the core returns one of these kinds. The enum
//! is `Clone` so a single failure can be shared with every deduplicated
//! waiter; variants therefore carry extracted data rather than live I/O
//! errors.

use std::time::Duration;

use thiserror::Error;

use crate::config::RetryConfig;

/// Network-level failure classes surfaced by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportCode {
    /// Peer closed or reset the connection mid-flight.
    ConnectionReset,
    /// The request exceeded the transport timeout.
    Timeout,
    /// Hostname resolution failed.
    DnsFailure,
    /// Resolver reported a temporary failure (EAI_AGAIN-class).
    TemporaryNameFailure,
    /// TLS negotiation failed.
    Tls,
    /// The response body could not be decoded.
    Malformed,
    /// Any other socket-level failure.
    Io,
}

impl TransportCode {
    /// Codes the retry engine treats as transient.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TransportCode::ConnectionReset
                | TransportCode::Timeout
                | TransportCode::DnsFailure
                | TransportCode::TemporaryNameFailure
        )
    }
}

/// Unified error type for the request-execution core.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Network failure reaching the remote.
    #[error("network error ({code:?}): {message}")]
    Transport { code: TransportCode, message: String },

    /// The remote signalled throttling (HTTP 429 or a `rate_limited` code).
    #[error("rate limited by the API: {message}")]
    RateLimited {
        /// Server-directed wait, parsed from `Retry-After`.
        retry_after: Option<Duration>,
        message: String,
    },

    /// 5xx or 408 from the remote.
    #[error("transient server error (status {status}): {message}")]
    ServerTransient { status: u16, code: Option<String>, message: String },

    /// Any other 4xx from the remote.
    #[error("API error (status {status}): {message}")]
    Client {
        status: u16,
        /// Machine-readable code from the error body, when present.
        code: Option<String>,
        message: String,
        /// Explicit retryability hint from the error body.
        retryable: Option<bool>,
    },

    /// Missing or rejected credential.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// The remote reports the addressed resource does not exist.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Caller-side argument problem detected before any transport work.
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// The circuit breaker refused the call without invoking it.
    #[error("circuit breaker open ({failures} consecutive failures, open for {open_for:?})")]
    CircuitOpen { failures: usize, open_for: Duration },

    /// A disk cache entry was unreadable. Recovered internally; callers
    /// only ever see this from explicit maintenance APIs.
    #[error("unreadable cache entry at {path}: {message}")]
    CacheCorruption { path: String, message: String },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Every attempt failed; `source` is the final error unchanged.
    #[error("retries exhausted after {attempts} attempts ({elapsed_ms}ms): {source}")]
    RetryExhausted {
        attempts: usize,
        elapsed_ms: u64,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn transport(code: TransportCode, message: impl Into<String>) -> Self {
        Error::Transport { code, message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation { message: message.into() }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Error::Auth { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound { message: message.into() }
    }

    /// Server-directed delay, if the remote supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            Error::RetryExhausted { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::ServerTransient { status, .. } | Error::Client { status, .. } => Some(*status),
            Error::RateLimited { .. } => Some(429),
            Error::RetryExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Machine-readable code from the remote error body, if any.
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Error::ServerTransient { code, .. } | Error::Client { code, .. } => code.as_deref(),
            Error::RateLimited { .. } => Some("rate_limited"),
            Error::RetryExhausted { source, .. } => source.api_code(),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Error::RetryExhausted { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Unwrap retry-exhaustion context, yielding the final upstream error.
    pub fn into_last_attempt(self) -> Error {
        match self {
            Error::RetryExhausted { source, .. } => *source,
            other => other,
        }
    }

    /// Whether the retry engine may re-attempt after this failure.
    ///
    /// An explicit `retryable: false` hint from the remote wins over every
    /// set-based rule.
    pub fn is_retryable(&self, config: &RetryConfig) -> bool {
        if let Error::Client { retryable: Some(false), .. } = self {
            return false;
        }
        match self {
            Error::Transport { code, .. } => code.is_transient(),
            Error::RateLimited { .. } => true,
            Error::ServerTransient { status, code, .. } => {
                config.retryable_statuses.contains(status)
                    || code.as_deref().is_some_and(|c| config.retryable_codes.contains(c))
            }
            Error::Client { status, code, .. } => {
                config.retryable_statuses.contains(status)
                    || code.as_deref().is_some_and(|c| config.retryable_codes.contains(c))
            }
            Error::Auth { .. }
            | Error::NotFound { .. }
            | Error::Validation { .. }
            | Error::CircuitOpen { .. }
            | Error::CacheCorruption { .. }
            | Error::Cancelled
            | Error::RetryExhausted { .. } => false,
        }
    }
}
