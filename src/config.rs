//! Configuration for every core subsystem.
//!
//! The CLI configures the core exclusively through the environment, so each
//! config type pairs hand-set builders with a `from_env()` that reads the
//! `NOTION_CLI_*` names. Unparseable values fall back to defaults rather
//! than failing: a bad env var must never break the command itself.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::key::Namespace;

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

/// Retry engine settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    pub base_delay: Duration,
    /// Ceiling for every wait, computed or server-directed.
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Symmetric jitter fraction in `[0, 1]`.
    pub jitter_factor: f64,
    /// HTTP statuses worth another attempt.
    pub retryable_statuses: HashSet<u16>,
    /// Remote API error codes worth another attempt.
    pub retryable_codes: HashSet<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            exponential_base: 2.0,
            jitter_factor: 0.1,
            retryable_statuses: [408, 429, 500, 502, 503, 504].into_iter().collect(),
            retryable_codes: [
                "rate_limited",
                "service_unavailable",
                "internal_server_error",
                "conflict_error",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>("NOTION_CLI_MAX_RETRIES") {
            config.max_attempts = n.max(1);
        }
        if let Some(d) = env_millis("NOTION_CLI_BASE_DELAY") {
            config.base_delay = d;
        }
        if let Some(d) = env_millis("NOTION_CLI_MAX_DELAY") {
            config.max_delay = d;
        }
        if let Some(b) = env_parse::<f64>("NOTION_CLI_EXP_BASE") {
            if b.is_finite() && b >= 1.0 {
                config.exponential_base = b;
            }
        }
        if let Some(j) = env_parse::<f64>("NOTION_CLI_JITTER_FACTOR") {
            if j.is_finite() {
                config.jitter_factor = j.clamp(0.0, 1.0);
            }
        }
        config
    }

    /// Tighter budget for bulk children/delete sweeps, where one stubborn
    /// operation should not stall the whole walk.
    pub fn for_bulk(&self) -> Self {
        let mut config = self.clone();
        config.max_attempts = config.max_attempts.min(2);
        config.max_delay = config.max_delay.min(Duration::from_secs(5));
        config
    }
}

/// Two-tier cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl: Duration,
    /// Memory-tier entry cap.
    pub max_entries: usize,
    pub ttl_by_namespace: HashMap<Namespace, Duration>,
    pub disk_enabled: bool,
    pub disk_dir: PathBuf,
    pub disk_max_bytes: u64,
    /// Write-behind flush period; zero means entries are written as they
    /// arrive.
    pub disk_sync_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let ttl_by_namespace = [
            (Namespace::DataSource, Duration::from_secs(600)),
            (Namespace::Database, Duration::from_secs(600)),
            (Namespace::User, Duration::from_secs(3600)),
            (Namespace::Page, Duration::from_secs(60)),
            (Namespace::Block, Duration::from_secs(30)),
            (Namespace::Search, Duration::from_secs(30)),
            (Namespace::Comment, Duration::from_secs(60)),
        ]
        .into_iter()
        .collect();
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(300),
            max_entries: 1000,
            ttl_by_namespace,
            disk_enabled: true,
            disk_dir: default_cache_dir(),
            disk_max_bytes: 50 * 1024 * 1024,
            disk_sync_interval: Duration::ZERO,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".notion-cli").join("cache")
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(b) = env_bool("NOTION_CLI_CACHE_ENABLED") {
            config.enabled = b;
        }
        if let Some(n) = env_parse::<usize>("NOTION_CLI_CACHE_MAX_SIZE") {
            config.max_entries = n.max(1);
        }
        if let Some(d) = env_millis("NOTION_CLI_CACHE_TTL") {
            config.default_ttl = d;
        }
        for (ns, var) in [
            (Namespace::DataSource, "NOTION_CLI_CACHE_DS_TTL"),
            (Namespace::Database, "NOTION_CLI_CACHE_DB_TTL"),
            (Namespace::User, "NOTION_CLI_CACHE_USER_TTL"),
            (Namespace::Page, "NOTION_CLI_CACHE_PAGE_TTL"),
            (Namespace::Block, "NOTION_CLI_CACHE_BLOCK_TTL"),
        ] {
            if let Some(d) = env_millis(var) {
                config.ttl_by_namespace.insert(ns, d);
            }
        }
        if let Some(b) = env_bool("NOTION_CLI_DISK_CACHE_ENABLED") {
            config.disk_enabled = b;
        }
        if let Some(n) = env_parse::<u64>("NOTION_CLI_DISK_CACHE_MAX_SIZE") {
            config.disk_max_bytes = n;
        }
        if let Some(d) = env_millis("NOTION_CLI_DISK_CACHE_SYNC_INTERVAL") {
            config.disk_sync_interval = d;
        }
        config
    }

    /// Effective TTL for a namespace when the caller gave no override.
    pub fn ttl_for(&self, namespace: Namespace) -> Duration {
        self.ttl_by_namespace.get(&namespace).copied().unwrap_or(self.default_ttl)
    }
}

/// Shared HTTPS client settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub keep_alive: bool,
    /// How long an idle pooled connection is kept.
    pub keep_alive_timeout: Duration,
    /// Total in-flight connection cap.
    pub max_sockets: usize,
    /// Idle pool size per host.
    pub max_free_sockets: usize,
    /// Per-request timeout covering header and body reception.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(60),
            max_sockets: 50,
            max_free_sockets: 10,
            timeout: Duration::from_secs(30),
            user_agent: concat!("notion-cli/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(b) = env_bool("NOTION_CLI_HTTP_KEEP_ALIVE") {
            config.keep_alive = b;
        }
        if let Some(d) = env_millis("NOTION_CLI_HTTP_KEEP_ALIVE_MS") {
            config.keep_alive_timeout = d;
        }
        if let Some(n) = env_parse::<usize>("NOTION_CLI_HTTP_MAX_SOCKETS") {
            config.max_sockets = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("NOTION_CLI_HTTP_MAX_FREE_SOCKETS") {
            config.max_free_sockets = n;
        }
        if let Some(d) = env_millis("NOTION_CLI_HTTP_TIMEOUT") {
            config.timeout = d;
        }
        config
    }
}

/// Default parallelism for the bulk entry points.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Bulk archive/delete fan-out.
    pub delete_concurrency: usize,
    /// Block-tree walk fan-out.
    pub children_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { delete_concurrency: 4, children_concurrency: 8 }
    }
}

impl BatchConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>("NOTION_CLI_DELETE_CONCURRENCY") {
            config.delete_concurrency = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("NOTION_CLI_CHILDREN_CONCURRENCY") {
            config.children_concurrency = n.max(1);
        }
        config
    }
}
