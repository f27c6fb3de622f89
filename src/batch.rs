//! Bounded-concurrency batch execution.
//!
//! Used by the bulk entry points (delete sweeps, block-tree walks). At most
//! `concurrency` operations run at once; results come back in input order,
//! and one operation's failure never cancels its siblings.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::retry::RetryPolicy;

/// Join spawned slots back into input order, mapping runtime failures into
/// per-slot errors.
async fn collect<T>(handles: Vec<JoinHandle<Result<T, Error>>>) -> Vec<Result<T, Error>> {
    join_all(handles)
        .await
        .into_iter()
        .map(|outcome| match outcome {
            Ok(result) => result,
            Err(join) if join.is_cancelled() => Err(Error::Cancelled),
            Err(join) => Err(Error::validation(format!("batch operation panicked: {join}"))),
        })
        .collect()
}

/// Run every operation, collecting per-slot outcomes in input order.
/// An empty input completes immediately without scheduling anything.
pub async fn run<T, F, Fut>(operations: Vec<F>, concurrency: usize) -> Vec<Result<T, Error>>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    if operations.is_empty() {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let handles: Vec<_> = operations
        .into_iter()
        .map(|op| {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(Error::Cancelled),
                };
                op().await
            })
        })
        .collect();

    collect(handles).await
}

/// Like [`run`], with each operation independently wrapped in the retry
/// policy. The batch itself never retries.
pub async fn run_with_retry<T, F, Fut>(
    operations: Vec<F>,
    concurrency: usize,
    retry: RetryPolicy,
) -> Vec<Result<T, Error>>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    if operations.is_empty() {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let handles: Vec<_> = operations
        .into_iter()
        .map(|op| {
            let semaphore = Arc::clone(&semaphore);
            let retry = retry.clone();
            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(Error::Cancelled),
                };
                retry.execute(op).await
            })
        })
        .collect();

    collect(handles).await
}
