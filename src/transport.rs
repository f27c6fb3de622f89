//! Shared HTTPS transport.
//!
//! One `reqwest::Client` per transport: keep-alive pooling, per-request
//! timeout, and transparent gzip/deflate/brotli decompression (the client
//! advertises `Accept-Encoding` for every enabled codec and hands the core
//! decoded bytes). A semaphore caps total in-flight requests, which reqwest
//! does not do on its own; `stats()` reports the slot accounting.
//!
//! Responses are mapped into the [`Error`] taxonomy here, including the
//! remote's `{code, message, retryable}` error bodies and `Retry-After`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::config::HttpConfig;
use crate::error::{Error, TransportCode};

/// Connection-slot accounting for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    /// Requests currently on the wire.
    pub active: usize,
    /// Free connection slots.
    pub idle: usize,
    /// Requests waiting for a slot.
    pub pending: usize,
    pub total_requests: u64,
}

/// Error body shape the remote returns alongside non-2xx statuses.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    code: Option<String>,
    message: Option<String>,
    retryable: Option<bool>,
}

pub struct Transport {
    client: Client,
    slots: Arc<Semaphore>,
    bearer: Option<String>,
    active: AtomicUsize,
    pending: AtomicUsize,
    total: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Transport {
    pub fn new(config: &HttpConfig, bearer: Option<String>) -> Result<Self, Error> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .tcp_keepalive(Some(Duration::from_secs(30)));

        builder = if config.keep_alive {
            builder
                .pool_idle_timeout(config.keep_alive_timeout)
                .pool_max_idle_per_host(config.max_free_sockets)
        } else {
            builder.pool_max_idle_per_host(0)
        };

        let client = builder
            .build()
            .map_err(|e| Error::validation(format!("http client construction failed: {e}")))?;

        Ok(Self {
            client,
            slots: Arc::new(Semaphore::new(config.max_sockets.max(1))),
            bearer,
            active: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Begin a request with the bearer credential attached.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Send a request under the connection cap, mapping network failures
    /// into the taxonomy. Status handling is the caller's (or
    /// [`send_json`](Self::send_json)'s) job.
    pub async fn execute(&self, builder: RequestBuilder) -> Result<Response, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }

        self.pending.fetch_add(1, Ordering::Relaxed);
        let permit = self.slots.acquire().await;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        let _permit = permit.map_err(|_| Error::Cancelled)?;

        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }

        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        let result = builder.send().await;
        self.active.fetch_sub(1, Ordering::Relaxed);

        result.map_err(map_transport_error)
    }

    /// Send, check the status, decode the JSON body.
    pub async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, Error> {
        let response = check_status(self.execute(builder).await?).await?;
        response.json::<T>().await.map_err(|e| {
            Error::transport(TransportCode::Malformed, format!("undecodable response body: {e}"))
        })
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            active: self.active.load(Ordering::Relaxed),
            idle: self.slots.available_permits(),
            pending: self.pending.load(Ordering::Relaxed),
            total_requests: self.total.load(Ordering::Relaxed),
        }
    }

    /// Close the gate: subsequent requests fail with `Cancelled`. The pool
    /// itself is released when the transport drops. Idempotent.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Map a non-success response into the taxonomy, consuming the body.
async fn check_status(response: Response) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
    let body: ApiErrorBody = response.json().await.unwrap_or_default();
    let message = body.message.unwrap_or_else(|| format!("HTTP {status}"));
    let code = body.code;

    Err(match status.as_u16() {
        401 | 403 => Error::Auth { message },
        404 => Error::NotFound { message },
        429 => Error::RateLimited { retry_after, message },
        408 => Error::ServerTransient { status: 408, code, message },
        s if s >= 500 => Error::ServerTransient { status: s, code, message },
        s => Error::Client { status: s, code, message, retryable: body.retryable },
    })
}

/// `Retry-After` is delta-seconds or an HTTP-date; a date already in the
/// past means no extra wait.
fn parse_retry_after(header: Option<&HeaderValue>) -> Option<Duration> {
    let raw = header?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = date.signed_duration_since(chrono::Utc::now());
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

fn map_transport_error(err: reqwest::Error) -> Error {
    // Chain the source messages; reqwest's top-level Display is terse.
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    if err.is_timeout() {
        return Error::transport(TransportCode::Timeout, message);
    }
    if err.is_decode() {
        return Error::transport(TransportCode::Malformed, message);
    }
    if err.is_builder() || err.is_request() {
        return Error::validation(message);
    }
    if err.is_connect() {
        let lowered = message.to_ascii_lowercase();
        let code = if lowered.contains("temporary failure in name resolution") {
            TransportCode::TemporaryNameFailure
        } else if lowered.contains("dns") || lowered.contains("name or service not known") {
            TransportCode::DnsFailure
        } else if lowered.contains("certificate") || lowered.contains("tls") {
            TransportCode::Tls
        } else {
            TransportCode::ConnectionReset
        };
        return Error::transport(code, message);
    }
    Error::transport(TransportCode::Io, message)
}
