//! In-memory cache tier.
//!
//! The hot tier in front of the disk cache: a TTL map with
//! oldest-by-creation eviction at capacity. A memory miss with the disk
//! tier enabled reads the disk record and promotes it synchronously, so a
//! fresh process keeps its warm entries from the previous run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::CacheConfig;
use crate::disk_cache::{now_millis, DiskCache};
use crate::events::{CoreEvent, Emitter};
use crate::key::{CacheKey, Namespace};

#[derive(Debug)]
struct MemoryEntry {
    data: Value,
    created_at: Instant,
    ttl: Duration,
}

impl MemoryEntry {
    /// A zero or negative-equivalent TTL is expired from the start.
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// Monotonic counters; observational only.
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    disk_hits: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    /// Hits served by disk promotion; included in `hits`.
    pub disk_hits: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    config: CacheConfig,
    disk: Option<Arc<DiskCache>>,
    counters: Counters,
    emitter: Arc<Emitter>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("size", &self.lock().len())
            .field("disk", &self.disk.is_some())
            .finish()
    }
}

impl MemoryCache {
    /// Construct both tiers from one config. Within a tokio runtime when
    /// the disk tier is enabled with a flush interval.
    pub fn new(config: CacheConfig, emitter: Arc<Emitter>) -> Self {
        let disk = (config.enabled && config.disk_enabled).then(|| DiskCache::new(&config));
        Self { entries: Mutex::new(HashMap::new()), config, disk, counters: Counters::default(), emitter }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn disk(&self) -> Option<&Arc<DiskCache>> {
        self.disk.as_ref()
    }

    /// Look up a key; expired entries are removed on access and never
    /// returned. A disk hit is promoted into memory before returning.
    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let canonical = key.canonical();

        {
            let mut entries = self.lock();
            match entries.get(&canonical) {
                Some(entry) if !entry.is_expired() => {
                    let data = entry.data.clone();
                    drop(entries);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    self.emitter.emit(CoreEvent::CacheHit {
                        namespace: key.namespace(),
                        key: canonical,
                    });
                    return Some(data);
                }
                Some(_) => {
                    entries.remove(&canonical);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    self.emitter.emit(CoreEvent::CacheEvict {
                        namespace: key.namespace(),
                        key: canonical.clone(),
                    });
                }
                None => {}
            }
        }

        if let Some(disk) = &self.disk {
            if let Some(record) = disk.read(&canonical).await {
                let remaining = record.remaining_ttl(now_millis());
                self.insert(canonical.clone(), record.data.clone(), remaining);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                self.emitter.emit(CoreEvent::DiskCacheHit {
                    namespace: key.namespace(),
                    key: canonical,
                });
                return Some(record.data);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.emitter.emit(CoreEvent::CacheMiss { namespace: key.namespace(), key: canonical });
        None
    }

    /// Store a value. TTL precedence: explicit override, then the
    /// namespace table, then the default. Mirrors to disk write-behind.
    pub async fn set(&self, key: &CacheKey, value: Value, ttl_override: Option<Duration>) {
        if !self.config.enabled {
            return;
        }
        let ttl = ttl_override.unwrap_or_else(|| self.config.ttl_for(key.namespace()));
        let canonical = key.canonical();

        self.insert(canonical.clone(), value.clone(), ttl);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.emitter.emit(CoreEvent::CacheSet {
            namespace: key.namespace(),
            key: canonical.clone(),
            ttl,
        });

        if let Some(disk) = &self.disk {
            disk.put(&canonical, value, ttl);
        }
    }

    /// Insert, evicting the oldest-by-creation entry if at capacity.
    fn insert(&self, canonical: String, value: Value, ttl: Duration) {
        let mut entries = self.lock();
        if !entries.contains_key(&canonical) && entries.len() >= self.config.max_entries.max(1) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                if self.emitter.enabled() {
                    if let Some(namespace) = Namespace::of_canonical(&oldest) {
                        self.emitter.emit(CoreEvent::CacheEvict { namespace, key: oldest });
                    }
                }
            }
        }
        entries.insert(canonical, MemoryEntry { data: value, created_at: Instant::now(), ttl });
    }

    /// Remove one exact key from both tiers.
    pub async fn invalidate(&self, key: &CacheKey) {
        let canonical = key.canonical();
        let removed = self.lock().remove(&canonical).is_some();
        if removed {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.emitter.emit(CoreEvent::CacheInvalidate {
            namespace: key.namespace(),
            key: Some(canonical.clone()),
        });
        if let Some(disk) = &self.disk {
            disk.invalidate(&canonical).await;
        }
    }

    /// Remove a key and every key that extends it with more segments
    /// (a data source plus its cached queries).
    pub async fn invalidate_prefix(&self, key: &CacheKey) {
        let prefix = key.canonical();
        let removed = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|candidate, _| {
                !(candidate == &prefix
                    || candidate.starts_with(&prefix) && candidate.as_bytes().get(prefix.len()) == Some(&b':'))
            });
            before - entries.len()
        };
        self.counters.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        self.emitter.emit(CoreEvent::CacheInvalidate {
            namespace: key.namespace(),
            key: Some(prefix.clone()),
        });
        if let Some(disk) = &self.disk {
            disk.invalidate_prefix(&prefix).await;
        }
    }

    /// Remove every key in a namespace from both tiers.
    pub async fn invalidate_namespace(&self, namespace: Namespace) {
        let prefix = namespace.as_str();
        let removed = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|candidate, _| Namespace::of_canonical(candidate) != Some(namespace));
            before - entries.len()
        };
        self.counters.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        self.emitter.emit(CoreEvent::CacheInvalidate { namespace, key: None });
        if let Some(disk) = &self.disk {
            disk.invalidate_prefix(prefix).await;
        }
    }

    /// Drop everything from both tiers.
    pub async fn clear(&self) {
        self.lock().clear();
        if let Some(disk) = &self.disk {
            disk.clear().await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            size: self.lock().len(),
        }
    }

    /// Flush and stop the disk tier. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(disk) = &self.disk {
            disk.shutdown().await;
        }
    }
}
