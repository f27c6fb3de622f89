//! On-disk cache tier.
//!
//! One JSON record per file under the cache root, named by a short hash of
//! the canonical key. Writes go to `<name>.json.tmp` and are renamed into
//! place, so a record file either does not exist or parses completely;
//! readers in other processes never observe partial writes. `.tmp` files
//! are invisible to reads, `clear`, and the size sweep — they may belong to
//! a concurrent writer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::key::hash_key;

/// Wall-clock milliseconds; disk records outlive the process, so they
/// cannot use `Instant`.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// One persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntry {
    /// Original canonical key, kept so sweeps can match without unhashing.
    pub key: String,
    pub data: Value,
    pub created_at: u64,
    pub expires_at: u64,
    /// Serialized payload size in bytes.
    pub size: u64,
}

impl DiskEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self, now: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }
}

fn key_matches(key: &str, prefix: &str) -> bool {
    key == prefix || (key.len() > prefix.len() && key.as_bytes()[prefix.len()] == b':' && key.starts_with(prefix))
}

pub struct DiskCache {
    root: PathBuf,
    max_bytes: u64,
    sync_interval: Duration,
    /// Records accepted but not yet flushed, keyed by file stem.
    dirty: Mutex<HashMap<String, DiskEntry>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    /// Fire-and-forget flushes spawned when no interval is configured.
    /// Invalidation and shutdown drain these so deletes cannot lose a race
    /// against a write already in flight.
    immediate_flushes: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("root", &self.root)
            .field("max_bytes", &self.max_bytes)
            .field("sync_interval", &self.sync_interval)
            .finish()
    }
}

impl DiskCache {
    /// Must be called within a tokio runtime when `disk_sync_interval` is
    /// non-zero (the flush task is spawned here).
    pub fn new(config: &CacheConfig) -> Arc<Self> {
        let cache = Arc::new(Self {
            root: config.disk_dir.clone(),
            max_bytes: config.disk_max_bytes,
            sync_interval: config.disk_sync_interval,
            dirty: Mutex::new(HashMap::new()),
            flush_task: Mutex::new(None),
            immediate_flushes: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        if !cache.sync_interval.is_zero() {
            let worker = Arc::clone(&cache);
            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = worker.cancel.cancelled() => break,
                        _ = tokio::time::sleep(worker.sync_interval) => {
                            worker.flush().await;
                            worker.prune_expired().await;
                        }
                    }
                }
            });
            *cache.flush_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
        }

        cache
    }

    fn path_for(&self, stem: &str) -> PathBuf {
        self.root.join(format!("{stem}.json"))
    }

    fn lock_dirty(&self) -> std::sync::MutexGuard<'_, HashMap<String, DiskEntry>> {
        self.dirty.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read the record for a key. Expired, corrupted, or colliding files
    /// are treated as absent; corrupted ones are deleted best-effort.
    pub async fn read(&self, canonical_key: &str) -> Option<DiskEntry> {
        let stem = hash_key(canonical_key);

        // Unflushed writes are authoritative over what is on disk.
        if let Some(entry) = self.lock_dirty().get(&stem).cloned() {
            return (!entry.is_expired(now_millis()) && entry.key == canonical_key).then_some(entry);
        }

        let path = self.path_for(&stem);
        let bytes = tokio::fs::read(&path).await.ok()?;
        let entry: DiskEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "dropping unreadable cache entry");
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    tracing::debug!(path = %path.display(), error = %err, "unreadable cache entry not removed");
                }
                return None;
            }
        };

        if entry.key != canonical_key {
            // Filename collision; the other key owns the slot.
            return None;
        }
        if entry.is_expired(now_millis()) {
            tokio::spawn(async move {
                let _ = tokio::fs::remove_file(&path).await;
            });
            return None;
        }
        Some(entry)
    }

    /// Accept a record for persistence. With a flush interval the record
    /// waits for the periodic task; otherwise it is written immediately in
    /// the background. No-op after shutdown.
    pub fn put(self: &Arc<Self>, canonical_key: &str, data: Value, ttl: Duration) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let now = now_millis();
        let entry = DiskEntry {
            key: canonical_key.to_string(),
            data,
            created_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
            size: 0,
        };
        self.lock_dirty().insert(hash_key(canonical_key), entry);

        if self.sync_interval.is_zero() {
            let cache = Arc::clone(self);
            let handle = tokio::spawn(async move {
                cache.flush().await;
            });
            let mut flushes =
                self.immediate_flushes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            flushes.retain(|task| !task.is_finished());
            flushes.push(handle);
        }
    }

    /// Wait for any fire-and-forget flushes to settle.
    async fn drain_immediate(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut flushes =
                self.immediate_flushes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            flushes.drain(..).collect()
        };
        for task in pending {
            let _ = task.await;
        }
    }

    /// Drain the dirty queue to disk, then enforce the size cap. Eviction
    /// runs after the writes, so a short over-cap window is observable.
    pub async fn flush(&self) {
        let pending: Vec<(String, DiskEntry)> = self.lock_dirty().drain().collect();
        if pending.is_empty() {
            return;
        }
        for (stem, mut entry) in pending {
            if let Err(err) = self.write_entry(&stem, &mut entry).await {
                tracing::debug!(key = %entry.key, error = %err, "disk cache write failed");
            }
        }
        self.enforce_cap().await;
    }

    async fn write_entry(&self, stem: &str, entry: &mut DiskEntry) -> std::io::Result<()> {
        let _ = tokio::fs::create_dir_all(&self.root).await;
        entry.size = entry.data.to_string().len() as u64;
        let body = serde_json::to_vec(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let path = self.path_for(stem);
        let tmp = self.root.join(format!("{stem}.json.tmp"));
        tokio::fs::write(&tmp, &body).await?;
        match tokio::fs::rename(&tmp, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(err)
            }
        }
    }

    /// Delete the record for a key, ignoring absence.
    pub async fn invalidate(&self, canonical_key: &str) {
        let stem = hash_key(canonical_key);
        self.lock_dirty().remove(&stem);
        self.drain_immediate().await;
        let _ = tokio::fs::remove_file(self.path_for(&stem)).await;
    }

    /// Delete every record whose key equals the prefix or extends it with
    /// further segments. Filenames are hashes, so this parses each record.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        self.lock_dirty().retain(|_, entry| !key_matches(&entry.key, prefix));
        self.drain_immediate().await;
        for (path, entry, _) in self.scan().await {
            if let Some(entry) = entry {
                if key_matches(&entry.key, prefix) {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
    }

    /// Remove every regular entry. `.tmp` files are left alone.
    pub async fn clear(&self) {
        self.lock_dirty().clear();
        self.drain_immediate().await;
        for (path, _, _) in self.scan().await {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    /// All regular entry files: `(path, parsed record, file length)`.
    /// Unparseable files yield `None` and are skipped by callers; a
    /// missing root directory is an empty cache.
    async fn scan(&self) -> Vec<(PathBuf, Option<DiskEntry>, u64)> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(_) => return out,
        };
        while let Ok(Some(item)) = dir.next_entry().await {
            let path = item.path();
            // `<stem>.json.tmp` has extension `tmp`, so this filter also
            // hides in-progress writes.
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let len = match item.metadata().await {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => continue,
            };
            let entry = tokio::fs::read(&path)
                .await
                .ok()
                .and_then(|bytes| serde_json::from_slice::<DiskEntry>(&bytes).ok());
            out.push((path, entry, len));
        }
        out
    }

    /// Delete entries past their expiry.
    pub async fn prune_expired(&self) {
        let now = now_millis();
        for (path, entry, _) in self.scan().await {
            if let Some(entry) = entry {
                if entry.is_expired(now) {
                    if let Err(err) = tokio::fs::remove_file(&path).await {
                        tracing::debug!(path = %path.display(), error = %err, "expired cache entry not removed");
                    }
                }
            }
        }
    }

    /// Evict oldest-by-creation entries until total size fits the cap.
    /// Corrupted files are ignored here; the read path handles them.
    async fn enforce_cap(&self) {
        if self.max_bytes == 0 {
            return;
        }
        let mut entries: Vec<(PathBuf, DiskEntry, u64)> = self
            .scan()
            .await
            .into_iter()
            .filter_map(|(path, entry, len)| entry.map(|e| (path, e, len)))
            .collect();
        let mut total: u64 = entries.iter().map(|(_, _, len)| len).sum();
        if total <= self.max_bytes {
            return;
        }

        entries.sort_by_key(|(_, entry, _)| entry.created_at);
        for (path, entry, len) in entries {
            if total <= self.max_bytes {
                break;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!(key = %entry.key, "evicted disk cache entry for size");
                    total = total.saturating_sub(len);
                }
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "size eviction skipped entry");
                }
            }
        }
    }

    /// Stop the flush task and persist anything still queued. Idempotent;
    /// no new writes are accepted afterwards.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let task = self.flush_task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.drain_immediate().await;
        self.flush().await;
    }
}
