//! Registry of per-namespace circuit breakers.
//!
//! One breaker guards each namespace's upstream; every caller for that
//! namespace shares the same state via cheap clones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::events::Emitter;
use crate::key::Namespace;

#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<Namespace, CircuitBreaker>>>,
    config: CircuitBreakerConfig,
    emitter: Arc<Emitter>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, emitter: Arc<Emitter>) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), config, emitter }
    }

    /// The breaker for a namespace, created on first use.
    pub fn get_or_create(&self, namespace: Namespace) -> CircuitBreaker {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(namespace)
            .or_insert_with(|| {
                CircuitBreaker::new(self.config.clone())
                    .with_events(Arc::clone(&self.emitter), namespace)
            })
            .clone()
    }

    /// Reset one breaker. Returns false if the namespace has none yet.
    pub fn reset(&self, namespace: Namespace) -> bool {
        let map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match map.get(&namespace) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for breaker in map.values() {
            breaker.reset();
        }
    }

    /// Snapshot of all breaker states, sorted by namespace.
    pub fn snapshot(&self) -> Vec<(Namespace, CircuitState)> {
        let map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<(Namespace, CircuitState)> =
            map.iter().map(|(ns, breaker)| (*ns, breaker.state())).collect();
        entries.sort_by_key(|(ns, _)| *ns);
        entries
    }
}
