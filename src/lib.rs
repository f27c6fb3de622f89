#![forbid(unsafe_code)]

//! # notion-cli-core
//!
//! Request-execution core for the Notion CLI. Every command handler funnels
//! its API calls through one primitive — *execute this call with caching,
//! deduplication, retry, and shared pooling* — built from:
//!
//! - **Retry** with exponential backoff, proportional jitter, and
//!   `Retry-After` awareness
//! - **Circuit breakers**, one per cache namespace
//! - A **two-tier cache**: in-memory TTL map over atomic-rename disk files
//! - **Request deduplication** collapsing concurrent identical reads
//! - A **bounded-concurrency batch executor** for bulk operations
//! - A **keep-alive HTTPS transport** with pooling and transparent
//!   decompression
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use notion_cli_core::{CacheKey, CoreConfig, CoreContext, FetchOptions, Namespace};
//! use serde_json::Value;
//!
//! # async fn example() -> Result<(), notion_cli_core::Error> {
//! let ctx = CoreContext::new(CoreConfig::from_env(), std::env::var("NOTION_TOKEN").ok())?;
//!
//! let key = CacheKey::new(Namespace::Page, ["d3b1a7c2"]);
//! let transport = ctx.transport().clone();
//! let page: Value = ctx
//!     .fetch(&key, FetchOptions::default(), move || {
//!         let transport = transport.clone();
//!         async move {
//!             transport
//!                 .send_json(transport.request(
//!                     reqwest::Method::GET,
//!                     "https://api.notion.com/v1/pages/d3b1a7c2",
//!                 ))
//!                 .await
//!         }
//!     })
//!     .await?;
//!
//! ctx.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Configuration comes from `NOTION_CLI_*` environment variables; see
//! [`CoreConfig::from_env`]. With `NOTION_CLI_VERBOSE` set, cache and retry
//! decisions are reported as JSON lines on stderr.

mod backoff;
mod batch;
mod circuit_breaker;
mod circuit_breaker_registry;
mod config;
mod dedup;
mod disk_cache;
mod error;
mod events;
mod fetcher;
mod jitter;
mod key;
mod memory_cache;
mod retry;
mod sleeper;
mod transport;

pub use backoff::Backoff;
pub use batch::{run as run_batch, run_with_retry as run_batch_with_retry};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Clock, MonotonicClock,
};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use config::{BatchConfig, CacheConfig, HttpConfig, RetryConfig};
pub use dedup::{DedupStats, Deduplicator};
pub use disk_cache::{DiskCache, DiskEntry};
pub use error::{Error, TransportCode};
pub use events::{CoreEvent, Emitter};
pub use fetcher::{
    global, init_global, CoreConfig, CoreContext, CoreStats, FetchOptions, Invalidation,
};
pub use jitter::Jitter;
pub use key::{canonical_json, hash_key, CacheKey, Namespace};
pub use memory_cache::{CacheStats, MemoryCache};
pub use retry::{RetryContext, RetryObserver, RetryPolicy};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{Transport, TransportStats};

pub mod prelude;
