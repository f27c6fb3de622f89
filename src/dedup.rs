//! Request deduplication.
//!
//! Concurrent callers for the same key collapse into one upstream call: the
//! first caller (the leader) runs the operation, everyone else subscribes
//! to its broadcast channel. The in-flight handle is removed before the
//! outcome is broadcast, so a caller arriving after completion always runs
//! a fresh invocation. Only side-effect-free reads go through here; the
//! fetcher routes writes around it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Error;

type Outcome = Result<Value, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    /// Callers that joined an existing in-flight request.
    pub hits: u64,
    /// Callers that executed upstream.
    pub misses: u64,
    pub in_flight: usize,
}

#[derive(Debug)]
pub struct Deduplicator {
    in_flight: Mutex<HashMap<String, broadcast::Sender<Outcome>>>,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Deduplicator {
    pub fn new(enabled: bool) -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Outcome>>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `op` under `key`, or await an identical in-flight call. Every
    /// concurrent caller observes the leader's outcome; if the leader is
    /// dropped mid-flight, waiters observe [`Error::Cancelled`].
    pub async fn execute<F, Fut>(&self, key: &str, op: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        if !self.enabled {
            return op().await;
        }

        let waiter = {
            let mut map = self.lock();
            match map.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    map.insert(key.to_string(), sender);
                    None
                }
            }
        };

        match waiter {
            Some(mut receiver) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "joined in-flight request");
                match receiver.recv().await {
                    Ok(outcome) => outcome,
                    // The channel only closes when the leader was dropped
                    // before broadcasting.
                    Err(_) => Err(Error::Cancelled),
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let guard = LeaderGuard { dedup: self, key, completed: false };
                let outcome = op().await;
                // Remove before broadcasting: late arrivals must lead anew.
                if let Some(sender) = guard.complete() {
                    let _ = sender.send(outcome.clone());
                }
                outcome
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

/// Removes the in-flight handle if the leader future is dropped before it
/// finished; dropping the sender wakes every waiter with a closed channel.
struct LeaderGuard<'a> {
    dedup: &'a Deduplicator,
    key: &'a str,
    completed: bool,
}

impl<'a> LeaderGuard<'a> {
    fn complete(mut self) -> Option<broadcast::Sender<Outcome>> {
        self.completed = true;
        self.dedup.lock().remove(self.key)
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.dedup.lock().remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_invocation() {
        let dedup = Arc::new(Deduplicator::new(true));
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let dedup = Arc::clone(&dedup);
            let invocations = Arc::clone(&invocations);
            handles.push(tokio::spawn(async move {
                dedup
                    .execute("page:shared", || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(json!("X"))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!("X"));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1, "exactly one upstream call");

        let stats = dedup.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 9);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn sequential_calls_do_not_dedupe() {
        let dedup = Deduplicator::new(true);
        let invocations = AtomicUsize::new(0);

        for _ in 0..2 {
            let result = dedup
                .execute("user:1", || async {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(1))
                })
                .await;
            assert!(result.is_ok());
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.stats().hits, 0);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let dedup = Arc::new(Deduplicator::new(true));
        let invocations = Arc::new(AtomicUsize::new(0));

        let a = {
            let dedup = Arc::clone(&dedup);
            let invocations = Arc::clone(&invocations);
            tokio::spawn(async move {
                dedup
                    .execute("page:a", || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("a"))
                    })
                    .await
            })
        };
        let b = {
            let dedup = Arc::clone(&dedup);
            let invocations = Arc::clone(&invocations);
            tokio::spawn(async move {
                dedup
                    .execute("page:b", || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("b"))
                    })
                    .await
            })
        };

        assert_eq!(a.await.unwrap().unwrap(), json!("a"));
        assert_eq!(b.await.unwrap().unwrap(), json!("b"));
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn leader_error_reaches_every_waiter() {
        let dedup = Arc::new(Deduplicator::new(true));

        let leader = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move {
                dedup
                    .execute("search:q", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(Error::not_found("nothing matched"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move {
                dedup.execute("search:q", || async { Ok(json!("never runs")) }).await
            })
        };

        assert!(leader.await.unwrap().unwrap_err().is_not_found());
        assert!(waiter.await.unwrap().unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn dropped_leader_cancels_waiters_and_frees_key() {
        let dedup = Arc::new(Deduplicator::new(true));

        let leader = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move {
                dedup
                    .execute("page:slow", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(json!("late"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(
                async move { dedup.execute("page:slow", || async { Ok(json!("x")) }).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let _ = leader.await;

        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(dedup.in_flight(), 0, "aborted leader releases the key");

        // The key is free again for a fresh invocation.
        let fresh = dedup.execute("page:slow", || async { Ok(json!("fresh")) }).await;
        assert_eq!(fresh.unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn disabled_dedup_always_invokes() {
        let dedup = Arc::new(Deduplicator::new(false));
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let dedup = Arc::clone(&dedup);
            let invocations = Arc::clone(&invocations);
            handles.push(tokio::spawn(async move {
                dedup
                    .execute("page:p", || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(json!(1))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
    }
}
