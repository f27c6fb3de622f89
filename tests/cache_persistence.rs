//! Cache behavior through the fetcher: TTL and LRU in the memory tier,
//! disk persistence across process lifetimes, and write invalidation.

use notion_cli_core::{
    CacheConfig, CacheKey, CoreConfig, CoreContext, FetchOptions, Invalidation, Namespace,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn disk_config(dir: &Path) -> CoreConfig {
    CoreConfig {
        cache: CacheConfig {
            disk_dir: dir.to_path_buf(),
            disk_sync_interval: Duration::ZERO,
            ..CacheConfig::default()
        },
        ..CoreConfig::default()
    }
}

fn memory_only_config(max_entries: usize) -> CoreConfig {
    CoreConfig {
        cache: CacheConfig { disk_enabled: false, max_entries, ..CacheConfig::default() },
        ..CoreConfig::default()
    }
}

async fn fetch_counting(
    ctx: &CoreContext,
    key: &CacheKey,
    counter: &Arc<AtomicUsize>,
    value: Value,
) -> Value {
    let counter = Arc::clone(counter);
    ctx.fetch(key, FetchOptions::default(), move || {
        let counter = Arc::clone(&counter);
        let value = value.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn disk_entry_survives_a_new_context() {
    let dir = tempfile::tempdir().unwrap();
    let key = CacheKey::new(Namespace::User, ["42"]);

    // First process: populate and shut down cleanly.
    let first = CoreContext::new(disk_config(dir.path()), None).unwrap();
    let upstream = Arc::new(AtomicUsize::new(0));
    fetch_counting(&first, &key, &upstream, json!({"name": "someone"})).await;
    first.shutdown().await;
    assert_eq!(upstream.load(Ordering::SeqCst), 1);

    // Second process: empty memory, same disk root.
    let second = CoreContext::new(disk_config(dir.path()), None).unwrap();
    let value = fetch_counting(&second, &key, &upstream, json!("should not be fetched")).await;
    assert_eq!(value, json!({"name": "someone"}), "served from disk, not upstream");
    assert_eq!(upstream.load(Ordering::SeqCst), 1, "no second upstream call");

    let stats = second.stats().cache;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.disk_hits, 1, "the hit is tagged as a disk promotion");
    second.shutdown().await;
}

#[tokio::test]
async fn expired_disk_entry_goes_back_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let key = CacheKey::new(Namespace::Page, ["short-lived"]);

    let first = CoreContext::new(disk_config(dir.path()), None).unwrap();
    let upstream = Arc::new(AtomicUsize::new(0));
    {
        let upstream = Arc::clone(&upstream);
        let _: Value = first
            .fetch(&key, FetchOptions::default().ttl(Duration::from_millis(50)), move || {
                let upstream = Arc::clone(&upstream);
                async move {
                    upstream.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("v1"))
                }
            })
            .await
            .unwrap();
    }
    first.shutdown().await;

    tokio::time::sleep(Duration::from_millis(80)).await;

    let second = CoreContext::new(disk_config(dir.path()), None).unwrap();
    let value = fetch_counting(&second, &key, &upstream, json!("v2")).await;
    assert_eq!(value, json!("v2"), "expired entry is not served");
    assert_eq!(upstream.load(Ordering::SeqCst), 2);
    second.shutdown().await;
}

#[tokio::test]
async fn lru_at_capacity_drops_oldest_key() {
    let ctx = CoreContext::new(memory_only_config(3), None).unwrap();
    let upstream = Arc::new(AtomicUsize::new(0));

    for id in ["a", "b", "c"] {
        let key = CacheKey::new(Namespace::Page, [id]);
        fetch_counting(&ctx, &key, &upstream, json!(id)).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let key_d = CacheKey::new(Namespace::Page, ["d"]);
    fetch_counting(&ctx, &key_d, &upstream, json!("d")).await;
    assert_eq!(upstream.load(Ordering::SeqCst), 4);

    // b, c, d still cached; a was evicted and fetches again.
    for id in ["b", "c", "d"] {
        let key = CacheKey::new(Namespace::Page, [id]);
        fetch_counting(&ctx, &key, &upstream, json!("fresh")).await;
    }
    assert_eq!(upstream.load(Ordering::SeqCst), 4, "b/c/d are cache hits");

    let key_a = CacheKey::new(Namespace::Page, ["a"]);
    let value = fetch_counting(&ctx, &key_a, &upstream, json!("a-again")).await;
    assert_eq!(value, json!("a-again"));
    assert_eq!(upstream.load(Ordering::SeqCst), 5, "a went back upstream");
}

#[tokio::test]
async fn data_source_write_invalidates_cached_queries() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CoreContext::new(disk_config(dir.path()), None).unwrap();
    let upstream = Arc::new(AtomicUsize::new(0));

    let source = CacheKey::new(Namespace::DataSource, ["ds1"]);
    let query = CacheKey::new(Namespace::DataSource, ["ds1", "query"])
        .push_json(&json!({"filter": {"done": false}}));

    fetch_counting(&ctx, &source, &upstream, json!({"schema": 1})).await;
    fetch_counting(&ctx, &query, &upstream, json!({"rows": [1, 2]})).await;
    assert_eq!(upstream.load(Ordering::SeqCst), 2);

    let _: Value = ctx
        .execute_write(
            Namespace::DataSource,
            Invalidation::for_data_source_write("ds1"),
            FetchOptions::default(),
            || async { Ok(json!({"updated": true})) },
        )
        .await
        .unwrap();

    // Both the source and its cached query refetch.
    fetch_counting(&ctx, &source, &upstream, json!({"schema": 2})).await;
    fetch_counting(&ctx, &query, &upstream, json!({"rows": []})).await;
    assert_eq!(upstream.load(Ordering::SeqCst), 4);
    ctx.shutdown().await;
}

#[tokio::test]
async fn clear_cache_empties_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CoreContext::new(disk_config(dir.path()), None).unwrap();
    let upstream = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::new(Namespace::Page, ["p"]);

    fetch_counting(&ctx, &key, &upstream, json!(1)).await;
    ctx.clear_cache().await;
    fetch_counting(&ctx, &key, &upstream, json!(2)).await;
    assert_eq!(upstream.load(Ordering::SeqCst), 2);
    ctx.shutdown().await;
}
