//! Circuit breaker with lock-free atomics.
//!
//! Closed → Open after `failure_threshold` consecutive failures; Open →
//! HalfOpen once `timeout` has elapsed; HalfOpen → Closed after
//! `success_threshold` consecutive probe successes, or back to Open on any
//! probe failure. While Open, calls fail fast with [`Error::CircuitOpen`]
//! without invoking the wrapped operation.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::events::{CoreEvent, Emitter};
use crate::key::Namespace;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Time source for the open-timeout measurement. The breaker only ever
/// compares millisecond deltas against `opened_at_millis`, so a fake that
/// hands out scripted values is enough to drive every transition in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds on a scale that only needs to move forward; the zero
    /// point is the clock's own business.
    fn now_millis(&self) -> u64;
}

/// Production clock: milliseconds since the breaker was constructed,
/// immune to wall-clock adjustments.
#[derive(Debug, Clone)]
pub struct MonotonicClock(Instant);

impl MonotonicClock {
    pub fn new() -> Self {
        Self(Instant::now())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: usize,
    /// Consecutive half-open successes required to close again.
    pub success_threshold: usize,
    /// How long the breaker stays open before permitting a probe.
    pub timeout: Duration,
    /// Concurrent probes permitted while half-open.
    pub half_open_max_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 2,
        }
    }
}

/// Shared mutable breaker state, separated out so registry handles can
/// reset and inspect a breaker that policies hold clones of.
#[derive(Debug, Default)]
pub struct CircuitBreakerState {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    half_open_successes: AtomicUsize,
    half_open_calls: AtomicUsize,
    opened_at_millis: AtomicU64,
}

impl CircuitBreakerState {
    pub fn current_state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Force Closed and zero every counter.
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    emitter: Arc<Emitter>,
    namespace: Option<Namespace>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state.current_state())
            .field("config", &self.config)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState::default()),
            config,
            clock: Arc::new(MonotonicClock::default()),
            emitter: Arc::new(Emitter::default()),
            namespace: None,
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Attach the event channel and the namespace label used in events.
    pub fn with_events(mut self, emitter: Arc<Emitter>, namespace: Namespace) -> Self {
        self.emitter = emitter;
        self.namespace = Some(namespace);
        self
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    pub fn reset(&self) {
        self.state.reset();
    }

    pub(crate) fn shared_state(&self) -> Arc<CircuitBreakerState> {
        Arc::clone(&self.state)
    }

    pub async fn execute<T, Fut, Op>(&self, mut op: Op) -> Result<T, Error>
    where
        T: Send,
        Fut: Future<Output = Result<T, Error>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);

                    if elapsed >= self.config.timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                // Won the race: first probe after the timeout.
                                tracing::info!(namespace = ?self.namespace, "circuit breaker half-open");
                                self.state.half_open_successes.store(0, Ordering::Release);
                                self.state.half_open_calls.store(1, Ordering::Release);
                                break;
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => break,
                            Err(_) => continue,
                        }
                    } else {
                        return Err(Error::CircuitOpen {
                            failures: self.state.consecutive_failures(),
                            open_for: Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(Error::CircuitOpen {
                            failures: self.state.consecutive_failures(),
                            open_for: Duration::ZERO,
                        });
                    }
                    break;
                }
                _ => break,
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = op().await;
        if was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            // Caller cancellation says nothing about service health.
            Err(Error::Cancelled) => {}
            Err(_) => self.on_failure(),
        }

        result
    }

    fn on_success(&self) {
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                let successes = self.state.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state.consecutive_failures.store(0, Ordering::Release);
                    self.state.half_open_successes.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!(namespace = ?self.namespace, "circuit breaker closed");
                    self.emitter.emit(CoreEvent::BreakerClose { namespace: self.namespace });
                }
            }
            STATE_CLOSED => {
                self.state.consecutive_failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let failures = self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.half_open_successes.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(namespace = ?self.namespace, failures, "probe failed, circuit breaker reopened");
                    self.emitter.emit(CoreEvent::BreakerOpen { namespace: self.namespace, failures });
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(
                        namespace = ?self.namespace,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker opened"
                    );
                    self.emitter.emit(CoreEvent::BreakerOpen { namespace: self.namespace, failures });
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64 as TestAtomicU64, AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<TestAtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(TestAtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn failing() -> Error {
        Error::ServerTransient { status: 500, code: None, message: "boom".into() }
    }

    fn breaker(threshold: usize, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout,
            ..CircuitBreakerConfig::default()
        })
    }

    async fn feed_failures(breaker: &CircuitBreaker, count: usize) {
        for _ in 0..count {
            let _ = breaker.execute(|| async { Err::<(), _>(failing()) }).await;
        }
    }

    #[tokio::test]
    async fn starts_closed_and_passes_through() {
        let breaker = breaker(3, Duration::from_secs(10));
        let result = breaker.execute(|| async { Ok::<_, Error>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let breaker = breaker(3, Duration::from_secs(10));
        feed_failures(&breaker, 3).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>(1) }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "open breaker must not invoke the operation");
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_count() {
        let breaker = breaker(3, Duration::from_secs(10));
        feed_failures(&breaker, 2).await;
        let _ = breaker.execute(|| async { Ok::<_, Error>(()) }).await;
        feed_failures(&breaker, 2).await;
        // 2 failures, success, 2 failures: never reaches the threshold.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn recovers_through_half_open_after_timeout() {
        let clock = ManualClock::new();
        let breaker = breaker(3, Duration::from_millis(500)).with_clock(clock.clone());

        feed_failures(&breaker, 3).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(500);
        // Two consecutive probe successes close the breaker.
        breaker.execute(|| async { Ok::<_, Error>(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.execute(|| async { Ok::<_, Error>(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.shared_state().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let clock = ManualClock::new();
        let breaker = breaker(2, Duration::from_millis(100)).with_clock(clock.clone());

        feed_failures(&breaker, 2).await;
        clock.advance(100);

        let result = breaker.execute(|| async { Err::<(), _>(failing()) }).await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        // The timeout re-arms from the reopen.
        let fast = breaker.execute(|| async { Ok::<_, Error>(()) }).await;
        assert!(fast.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = breaker(1, Duration::from_secs(60));
        feed_failures(&breaker, 1).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        let result = breaker.execute(|| async { Ok::<_, Error>(9) }).await;
        assert_eq!(result.unwrap(), 9);
    }

    #[tokio::test]
    async fn cancellation_does_not_count_as_failure() {
        let breaker = breaker(1, Duration::from_secs(60));
        let _ = breaker.execute(|| async { Err::<(), _>(Error::Cancelled) }).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
