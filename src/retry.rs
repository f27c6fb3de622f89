//! Adaptive retry engine.
//!
//! Attempts run strictly in sequence; between failures the engine sleeps on
//! an injectable [`Sleeper`], honoring a server-directed `Retry-After` over
//! its own exponential backoff. Classification comes from
//! [`Error::is_retryable`]; non-retryable failures short-circuit after a
//! single attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::RetryConfig;
use crate::error::Error;
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Snapshot handed to the observer before each backoff sleep.
pub struct RetryContext<'a> {
    /// 1-indexed number of the attempt that just failed.
    pub attempt: usize,
    pub max_attempts: usize,
    /// The wait about to be taken before the next attempt.
    pub next_delay: Duration,
    pub error: &'a Error,
}

pub type RetryObserver = Arc<dyn Fn(&RetryContext<'_>) + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    observer: Option<RetryObserver>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.config.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        let backoff = Backoff::new(config.base_delay, config.max_delay, config.exponential_base);
        let jitter = Jitter::proportional(config.jitter_factor);
        Self { config, backoff, jitter, sleeper: Arc::new(TokioSleeper), observer: None }
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn execute<T, Fut, Op>(&self, op: Op) -> Result<T, Error>
    where
        T: Send,
        Fut: Future<Output = Result<T, Error>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_cancellable(op, &CancellationToken::new()).await
    }

    /// Run `op` up to `max_attempts` times, stopping at the next suspension
    /// point once `cancel` fires.
    pub async fn execute_cancellable<T, Fut, Op>(
        &self,
        mut op: Op,
        cancel: &CancellationToken,
    ) -> Result<T, Error>
    where
        T: Send,
        Fut: Future<Output = Result<T, Error>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Racing the attempt itself means an in-progress request is
            // dropped (and thereby aborted) the moment the caller cancels.
            let attempt_result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = op() => result,
            };

            match attempt_result {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable(&self.config) {
                        return Err(error);
                    }
                    if attempt == max_attempts {
                        return Err(Error::RetryExhausted {
                            attempts: max_attempts,
                            elapsed_ms: started.elapsed().as_millis() as u64,
                            source: Box::new(error),
                        });
                    }

                    let next_delay = self.next_delay(attempt, &error);
                    if let Some(observer) = &self.observer {
                        observer(&RetryContext {
                            attempt,
                            max_attempts,
                            next_delay,
                            error: &error,
                        });
                    }
                    tracing::debug!(
                        attempt,
                        max_attempts,
                        delay_ms = next_delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, backing off"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = self.sleeper.sleep(next_delay) => {}
                    }
                }
            }
        }

        unreachable!("retry loop returns from within the attempt loop")
    }

    /// A `Retry-After` replaces the computed delay and takes no jitter;
    /// both paths are capped at `max_delay`.
    fn next_delay(&self, attempt: usize, error: &Error) -> Duration {
        match error.retry_after() {
            Some(server_directed) => server_directed.min(self.backoff.max_delay()),
            None => self.jitter.apply(self.backoff.delay(attempt)).min(self.backoff.max_delay()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportCode;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn transient() -> Error {
        Error::ServerTransient { status: 503, code: None, message: "unavailable".into() }
    }

    fn policy(max_attempts: usize) -> RetryPolicy {
        let config = RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(10_000),
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        RetryPolicy::new(config).with_sleeper(InstantSleeper)
    }

    #[tokio::test]
    async fn first_attempt_success_skips_backoff() {
        let calls = AtomicUsize::new(0);
        let result = policy(3)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = policy(5)
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(transient()) } else { Ok("done") } }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_performs_exact_attempts_and_keeps_last_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = policy(3)
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(Error::ServerTransient {
                        status: 503,
                        code: None,
                        message: format!("failure {n}"),
                    })
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            Error::RetryExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                match *source {
                    Error::ServerTransient { message, .. } => assert_eq!(message, "failure 2"),
                    other => panic!("unexpected final error: {other:?}"),
                }
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_short_circuits() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = policy(5)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::not_found("gone")) }
            })
            .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_false_hint_short_circuits() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = policy(5)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::Client {
                        status: 409,
                        code: Some("conflict_error".into()),
                        message: "told not to".into(),
                        retryable: Some(false),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_after_replaces_computed_delay() {
        let sleeper = TrackingSleeper::new();
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(10_000),
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::new(config).with_sleeper(sleeper.clone());

        let calls = AtomicUsize::new(0);
        let result = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::RateLimited {
                            retry_after: Some(Duration::from_secs(2)),
                            message: "throttled".into(),
                        })
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sleeper.calls(), vec![Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn adversarial_retry_after_is_capped() {
        let sleeper = TrackingSleeper::new();
        let config = RetryConfig {
            max_attempts: 2,
            max_delay: Duration::from_millis(500),
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::new(config).with_sleeper(sleeper.clone());

        let calls = AtomicUsize::new(0);
        let _ = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::RateLimited {
                            retry_after: Some(Duration::from_secs(3600)),
                            message: "go away".into(),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(sleeper.calls(), vec![Duration::from_millis(500)]);
    }

    #[tokio::test]
    async fn computed_delays_never_exceed_cap() {
        let sleeper = TrackingSleeper::new();
        let config = RetryConfig {
            max_attempts: 8,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            exponential_base: 3.0,
            jitter_factor: 0.5,
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::new(config).with_sleeper(sleeper.clone());

        let _: Result<(), _> = policy.execute(|| async { Err(transient()) }).await;
        let calls = sleeper.calls();
        assert_eq!(calls.len(), 7);
        for delay in calls {
            assert!(delay <= Duration::from_millis(400), "uncapped delay {delay:?}");
        }
    }

    #[tokio::test]
    async fn observer_sees_each_backoff() {
        let seen: Arc<Mutex<Vec<(usize, Duration)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let observer: RetryObserver = Arc::new(move |ctx: &RetryContext<'_>| {
            seen_clone.lock().unwrap().push((ctx.attempt, ctx.next_delay));
        });

        let policy = policy(3).with_observer(observer);
        let calls = AtomicUsize::new(0);
        let _ = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(transient()) } else { Ok(()) } }
            })
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[0].1, Duration::from_millis(100));
        assert_eq!(seen[1].0, 2);
        assert_eq!(seen[1].1, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = policy(3)
            .execute_cancellable(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::transport(TransportCode::Timeout, "slow")) }
                },
                &cancel,
            )
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
