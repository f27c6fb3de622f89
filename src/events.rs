//! Machine-readable cache/retry/breaker events.
//!
//! With `NOTION_CLI_VERBOSE` (or `NOTION_CLI_DEBUG`) set, the core emits one
//! JSON object per event on stderr so scripts can trace cache and retry
//! behavior without parsing log text. Events never affect control flow and
//! are dropped wholesale when verbose mode is off.

use std::time::Duration;

use serde_json::{json, Value};

use crate::config::env_bool;
use crate::key::Namespace;

/// One observable core event.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    CacheHit { namespace: Namespace, key: String },
    CacheMiss { namespace: Namespace, key: String },
    CacheSet { namespace: Namespace, key: String, ttl: Duration },
    CacheEvict { namespace: Namespace, key: String },
    CacheInvalidate { namespace: Namespace, key: Option<String> },
    DiskCacheHit { namespace: Namespace, key: String },
    RetryAttempt { namespace: Option<Namespace>, attempt: usize, delay: Duration },
    BreakerOpen { namespace: Option<Namespace>, failures: usize },
    BreakerClose { namespace: Option<Namespace> },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::CacheHit { .. } => "cache_hit",
            CoreEvent::CacheMiss { .. } => "cache_miss",
            CoreEvent::CacheSet { .. } => "cache_set",
            CoreEvent::CacheEvict { .. } => "cache_evict",
            CoreEvent::CacheInvalidate { .. } => "cache_invalidate",
            CoreEvent::DiskCacheHit { .. } => "disk_cache_hit",
            CoreEvent::RetryAttempt { .. } => "retry_attempt",
            CoreEvent::BreakerOpen { .. } => "breaker_open",
            CoreEvent::BreakerClose { .. } => "breaker_close",
        }
    }

    pub fn level(&self) -> &'static str {
        match self {
            CoreEvent::BreakerOpen { .. } => "warn",
            CoreEvent::RetryAttempt { .. } | CoreEvent::BreakerClose { .. } => "info",
            _ => "debug",
        }
    }

    pub fn to_json(&self) -> Value {
        let mut fields = serde_json::Map::new();
        fields.insert("event".into(), json!(self.name()));
        fields.insert("level".into(), json!(self.level()));
        match self {
            CoreEvent::CacheHit { namespace, key }
            | CoreEvent::CacheMiss { namespace, key }
            | CoreEvent::CacheEvict { namespace, key }
            | CoreEvent::DiskCacheHit { namespace, key } => {
                fields.insert("namespace".into(), json!(namespace.as_str()));
                fields.insert("key".into(), json!(key));
            }
            CoreEvent::CacheSet { namespace, key, ttl } => {
                fields.insert("namespace".into(), json!(namespace.as_str()));
                fields.insert("key".into(), json!(key));
                fields.insert("ttl".into(), json!(ttl.as_millis() as u64));
            }
            CoreEvent::CacheInvalidate { namespace, key } => {
                fields.insert("namespace".into(), json!(namespace.as_str()));
                if let Some(key) = key {
                    fields.insert("key".into(), json!(key));
                }
            }
            CoreEvent::RetryAttempt { namespace, attempt, delay } => {
                if let Some(ns) = namespace {
                    fields.insert("namespace".into(), json!(ns.as_str()));
                }
                fields.insert("attempt".into(), json!(attempt));
                fields.insert("delay_ms".into(), json!(delay.as_millis() as u64));
            }
            CoreEvent::BreakerOpen { namespace, failures } => {
                if let Some(ns) = namespace {
                    fields.insert("namespace".into(), json!(ns.as_str()));
                }
                fields.insert("failures".into(), json!(failures));
            }
            CoreEvent::BreakerClose { namespace } => {
                if let Some(ns) = namespace {
                    fields.insert("namespace".into(), json!(ns.as_str()));
                }
            }
        }
        Value::Object(fields)
    }
}

/// Stderr event sink. Cheap to clone behind an `Arc` and safe to share.
#[derive(Debug, Default)]
pub struct Emitter {
    enabled: bool,
}

impl Emitter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn from_env() -> Self {
        let enabled = env_bool("NOTION_CLI_VERBOSE").unwrap_or(false)
            || env_bool("NOTION_CLI_DEBUG").unwrap_or(false);
        Self { enabled }
    }

    /// Whether events will be written; lets call sites skip building them.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn emit(&self, event: CoreEvent) {
        if self.enabled {
            eprintln!("{}", event.to_json());
        }
    }
}
