//! Cached fetch orchestration.
//!
//! [`CoreContext`] owns the shared transport, the two-tier cache, the
//! deduplicator, and the per-namespace breakers, and exposes the one
//! primitive every command handler calls: execute this API call with
//! caching, deduplication, retry, and pooling. Construct it explicitly and
//! pass it into handlers; the process-wide global is a convenience wrapper.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::batch;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::config::{env_bool, BatchConfig, CacheConfig, HttpConfig, RetryConfig};
use crate::dedup::{DedupStats, Deduplicator};
use crate::error::Error;
use crate::events::{CoreEvent, Emitter};
use crate::key::{CacheKey, Namespace};
use crate::memory_cache::{CacheStats, MemoryCache};
use crate::retry::{RetryContext, RetryObserver, RetryPolicy};
use crate::transport::{Transport, TransportStats};

/// Whole-core configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub http: HttpConfig,
    pub batch: BatchConfig,
    pub dedup_enabled: bool,
    /// Breaker settings; `None` disables circuit breaking entirely.
    pub breaker: Option<CircuitBreakerConfig>,
    /// Restrict breakers to these namespaces; `None` guards all of them.
    pub breaker_namespaces: Option<Vec<Namespace>>,
    pub verbose: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            http: HttpConfig::default(),
            batch: BatchConfig::default(),
            dedup_enabled: true,
            breaker: Some(CircuitBreakerConfig::default()),
            breaker_namespaces: None,
            verbose: false,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            retry: RetryConfig::from_env(),
            cache: CacheConfig::from_env(),
            http: HttpConfig::from_env(),
            batch: BatchConfig::from_env(),
            ..Self::default()
        };
        if let Some(b) = env_bool("NOTION_CLI_DEDUP_ENABLED") {
            config.dedup_enabled = b;
        }
        config.verbose = env_bool("NOTION_CLI_VERBOSE").unwrap_or(false)
            || env_bool("NOTION_CLI_DEBUG").unwrap_or(false);
        config
    }
}

/// Per-call options for [`CoreContext::fetch`] and
/// [`CoreContext::execute_write`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// TTL override for the cached result.
    pub ttl: Option<Duration>,
    /// Skip both cache tiers for this call.
    pub no_cache: bool,
    /// Retry settings override for this call.
    pub retry: Option<RetryConfig>,
    /// Cooperative cancellation; honored at every suspension point.
    pub cancel: Option<CancellationToken>,
}

impl FetchOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// One cache-invalidation step applied after a successful write.
#[derive(Debug, Clone)]
pub enum Invalidation {
    /// Exactly one key.
    Key(CacheKey),
    /// A key and every key extending it with more segments.
    Subtree(CacheKey),
    /// Everything in a namespace.
    Namespace(Namespace),
}

impl Invalidation {
    /// Invalidations for a page create/update/archive: the page itself,
    /// its block tree, and the same for the parent it hangs under.
    pub fn for_page_write(page_id: &str, parent_page_id: Option<&str>) -> Vec<Invalidation> {
        let mut out = vec![
            Invalidation::Key(CacheKey::new(Namespace::Page, [page_id])),
            Invalidation::Subtree(CacheKey::new(Namespace::Block, [page_id])),
            Invalidation::Namespace(Namespace::Search),
        ];
        if let Some(parent) = parent_page_id {
            out.push(Invalidation::Key(CacheKey::new(Namespace::Page, [parent])));
            out.push(Invalidation::Subtree(CacheKey::new(Namespace::Block, [parent])));
        }
        out
    }

    /// Invalidations for a data-source schema or row write: the source and
    /// every cached query of it, plus its database mirror.
    pub fn for_data_source_write(data_source_id: &str) -> Vec<Invalidation> {
        vec![
            Invalidation::Subtree(CacheKey::new(Namespace::DataSource, [data_source_id])),
            Invalidation::Key(CacheKey::new(Namespace::Database, [data_source_id])),
            Invalidation::Namespace(Namespace::Search),
        ]
    }
}

/// Aggregate counters across the core's subsystems.
#[derive(Debug, Clone, Copy)]
pub struct CoreStats {
    pub cache: CacheStats,
    pub dedup: DedupStats,
    pub transport: TransportStats,
}

pub struct CoreContext {
    transport: Arc<Transport>,
    cache: Arc<MemoryCache>,
    dedup: Arc<Deduplicator>,
    breakers: CircuitBreakerRegistry,
    emitter: Arc<Emitter>,
    config: CoreConfig,
    closed: AtomicBool,
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl CoreContext {
    /// Construct within a tokio runtime: the disk tier's background tasks
    /// spawn from here.
    pub fn new(config: CoreConfig, bearer: Option<String>) -> Result<Arc<Self>, Error> {
        let emitter = Arc::new(Emitter::new(config.verbose));
        let transport = Arc::new(Transport::new(&config.http, bearer)?);
        let cache = Arc::new(MemoryCache::new(config.cache.clone(), Arc::clone(&emitter)));
        let dedup = Arc::new(Deduplicator::new(config.dedup_enabled));
        let breakers = CircuitBreakerRegistry::new(
            config.breaker.clone().unwrap_or_default(),
            Arc::clone(&emitter),
        );
        Ok(Arc::new(Self {
            transport,
            cache,
            dedup,
            breakers,
            emitter,
            config,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn from_env(bearer: Option<String>) -> Result<Arc<Self>, Error> {
        Self::new(CoreConfig::from_env(), bearer)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    fn breaker_for(&self, namespace: Namespace) -> Option<CircuitBreaker> {
        self.config.breaker.as_ref()?;
        if let Some(namespaces) = &self.config.breaker_namespaces {
            if !namespaces.contains(&namespace) {
                return None;
            }
        }
        Some(self.breakers.get_or_create(namespace))
    }

    fn retry_policy(&self, namespace: Namespace, override_config: Option<RetryConfig>) -> RetryPolicy {
        let config = override_config.unwrap_or_else(|| self.config.retry.clone());
        let emitter = Arc::clone(&self.emitter);
        let observer: RetryObserver = Arc::new(move |ctx: &RetryContext<'_>| {
            emitter.emit(CoreEvent::RetryAttempt {
                namespace: Some(namespace),
                attempt: ctx.attempt,
                delay: ctx.next_delay,
            });
        });
        RetryPolicy::new(config).with_observer(observer)
    }

    /// The read primitive: memory, then disk, then one deduplicated
    /// upstream call under breaker and retry, with the result written back
    /// through both tiers before any waiter sees it.
    pub async fn fetch<T, F, Fut>(&self, key: &CacheKey, opts: FetchOptions, op: F) -> Result<T, Error>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, Error>> + Send,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        let cancel = opts.cancel.clone().unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let use_cache = self.config.cache.enabled && !opts.no_cache;
        if use_cache {
            if let Some(value) = self.cache.get(key).await {
                return from_cached(value);
            }
        }

        let namespace = key.namespace();
        let retry = self.retry_policy(namespace, opts.retry.clone());
        let breaker = self.breaker_for(namespace);
        let canonical = key.canonical();

        // Retry and dedup move `serde_json::Value`s; the cell lets the
        // retry loop re-invoke the caller's `FnMut` from inside a breaker
        // closure.
        let cell = Arc::new(Mutex::new(op));
        let call = {
            let cell = Arc::clone(&cell);
            move || {
                let fut = {
                    let mut op = cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    op()
                };
                async move {
                    let value = fut.await?;
                    serde_json::to_value(value)
                        .map_err(|e| Error::validation(format!("unserializable response: {e}")))
                }
            }
        };

        let outcome = self
            .dedup
            .execute(&canonical, || async {
                let value = match &breaker {
                    Some(breaker) => {
                        breaker
                            .execute(|| retry.execute_cancellable(call.clone(), &cancel))
                            .await?
                    }
                    None => retry.execute_cancellable(call.clone(), &cancel).await?,
                };
                if use_cache {
                    // Inside the leader: caches are populated before the
                    // in-flight handle resolves.
                    self.cache.set(key, value.clone(), opts.ttl).await;
                }
                Ok(value)
            })
            .await?;

        from_cached(outcome)
    }

    /// The write primitive: no cache read, no dedup. On success every
    /// affected key is invalidated in both tiers.
    pub async fn execute_write<T, F, Fut>(
        &self,
        namespace: Namespace,
        invalidations: Vec<Invalidation>,
        opts: FetchOptions,
        op: F,
    ) -> Result<T, Error>
    where
        T: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, Error>> + Send,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        let cancel = opts.cancel.clone().unwrap_or_default();
        let retry = self.retry_policy(namespace, opts.retry.clone());
        let breaker = self.breaker_for(namespace);

        // Same composition as reads; the operation cell lets retry
        // re-invoke the caller's closure from inside the breaker.
        let cell = Arc::new(Mutex::new(op));
        let call = {
            let cell = Arc::clone(&cell);
            move || {
                let fut = {
                    let mut op = cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    op()
                };
                fut
            }
        };

        let value = match &breaker {
            Some(breaker) => {
                breaker.execute(|| retry.execute_cancellable(call.clone(), &cancel)).await?
            }
            None => retry.execute_cancellable(call, &cancel).await?,
        };

        for invalidation in &invalidations {
            self.invalidate(invalidation).await;
        }
        Ok(value)
    }

    /// Apply one invalidation step to both cache tiers.
    pub async fn invalidate(&self, invalidation: &Invalidation) {
        match invalidation {
            Invalidation::Key(key) => self.cache.invalidate(key).await,
            Invalidation::Subtree(key) => self.cache.invalidate_prefix(key).await,
            Invalidation::Namespace(namespace) => self.cache.invalidate_namespace(*namespace).await,
        }
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    /// Bulk fan-out with the tighter per-operation retry budget.
    pub async fn run_batch<T, F, Fut>(
        &self,
        operations: Vec<F>,
        concurrency: usize,
    ) -> Vec<Result<T, Error>>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let retry = RetryPolicy::new(self.config.retry.for_bulk());
        batch::run_with_retry(operations, concurrency, retry).await
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            cache: self.cache.stats(),
            dedup: self.dedup.stats(),
            transport: self.transport.stats(),
        }
    }

    /// Flush the disk tier, stop its timer, and close the transport.
    /// Idempotent; in-flight deduplicated calls finish on their own.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cache.shutdown().await;
        self.transport.shutdown();
    }
}

fn from_cached<T: DeserializeOwned>(value: Value) -> Result<T, Error> {
    serde_json::from_value(value)
        .map_err(|e| Error::validation(format!("cached value does not deserialize: {e}")))
}

static GLOBAL: OnceLock<Arc<CoreContext>> = OnceLock::new();

/// Install the process-wide context. Fails if one is already installed.
pub fn init_global(context: Arc<CoreContext>) -> Result<(), Error> {
    GLOBAL
        .set(context)
        .map_err(|_| Error::validation("core context already initialized"))
}

/// The installed process-wide context, if any.
pub fn global() -> Option<Arc<CoreContext>> {
    GLOBAL.get().cloned()
}
