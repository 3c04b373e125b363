//! Metrics collection for the fetch pipeline.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ErrorKind;
use crate::resilience::{CircuitBreakerHook, CircuitState};
use crate::types::DataCategory;

/// Metrics collector interface.
pub trait MetricsCollector: Send + Sync {
    /// Records the outcome and latency of one logical fetch.
    fn record_fetch(&self, category: DataCategory, success: bool, duration: Duration);

    /// Records whether a fetch was served without calling upstream itself.
    fn record_cache(&self, hit: bool);

    /// Records an error by kind.
    fn record_error(&self, kind: ErrorKind);

    /// Records one retry scheduled by the resilience executor.
    fn record_retry(&self, delay: Duration);

    /// Records a caller that had to queue at the rate limiter.
    fn record_rate_limit_wait(&self, waited: Duration);

    /// Records a circuit breaker transition.
    fn record_circuit_transition(&self, from: CircuitState, to: CircuitState);

    /// Gets current metrics.
    fn get_metrics(&self) -> FetchMetrics;

    /// Resets all metrics.
    fn reset(&self);
}

/// Metrics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchMetrics {
    /// Logical fetches completed.
    pub total_fetches: u64,
    /// Successful fetches.
    pub successful_fetches: u64,
    /// Failed fetches.
    pub failed_fetches: u64,
    /// Summed fetch latency in milliseconds.
    pub total_latency_ms: u64,
    /// Fetches served from cache or a joined flight.
    pub cache_hits: u64,
    /// Fetches that ran the upstream pipeline.
    pub cache_misses: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Summed retry backoff in milliseconds.
    pub total_retry_delay_ms: u64,
    /// Callers that queued at the rate limiter.
    pub rate_limit_waits: u64,
    /// Summed rate-limit queue time in milliseconds.
    pub total_rate_limit_wait_ms: u64,
    /// Fetches per category.
    pub categories: HashMap<String, u64>,
    /// Error counts by kind.
    pub errors: HashMap<String, u64>,
    /// Circuit transitions, keyed `"from->to"`.
    pub circuit_transitions: HashMap<String, u64>,
}

impl FetchMetrics {
    /// Calculates average latency in milliseconds.
    pub fn average_latency_ms(&self) -> f64 {
        if self.total_fetches == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.total_fetches as f64
        }
    }

    /// Calculates success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total_fetches == 0 {
            100.0
        } else {
            (self.successful_fetches as f64 / self.total_fetches as f64) * 100.0
        }
    }

    /// Calculates cache hit rate as a percentage.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }
}

/// Default metrics collector implementation.
#[derive(Default)]
pub struct DefaultMetricsCollector {
    total_fetches: AtomicU64,
    successful_fetches: AtomicU64,
    failed_fetches: AtomicU64,
    total_latency_ms: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    total_retry_delay_ms: AtomicU64,
    rate_limit_waits: AtomicU64,
    total_rate_limit_wait_ms: AtomicU64,
    categories: RwLock<HashMap<String, u64>>,
    errors: RwLock<HashMap<String, u64>>,
    circuit_transitions: RwLock<HashMap<String, u64>>,
}

impl DefaultMetricsCollector {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn bump(map: &RwLock<HashMap<String, u64>>, key: &str) {
    *map.write().entry(key.to_string()).or_insert(0) += 1;
}

impl MetricsCollector for DefaultMetricsCollector {
    fn record_fetch(&self, category: DataCategory, success: bool, duration: Duration) {
        self.total_fetches.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_fetches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_fetches.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms
            .fetch_add(millis(duration), Ordering::Relaxed);
        bump(&self.categories, category.as_str());
    }

    fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_error(&self, kind: ErrorKind) {
        bump(&self.errors, kind.as_str());
    }

    fn record_retry(&self, delay: Duration) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.total_retry_delay_ms
            .fetch_add(millis(delay), Ordering::Relaxed);
    }

    fn record_rate_limit_wait(&self, waited: Duration) {
        self.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
        self.total_rate_limit_wait_ms
            .fetch_add(millis(waited), Ordering::Relaxed);
    }

    fn record_circuit_transition(&self, from: CircuitState, to: CircuitState) {
        bump(&self.circuit_transitions, &format!("{from}->{to}"));
    }

    fn get_metrics(&self) -> FetchMetrics {
        FetchMetrics {
            total_fetches: self.total_fetches.load(Ordering::Relaxed),
            successful_fetches: self.successful_fetches.load(Ordering::Relaxed),
            failed_fetches: self.failed_fetches.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            total_retry_delay_ms: self.total_retry_delay_ms.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            total_rate_limit_wait_ms: self.total_rate_limit_wait_ms.load(Ordering::Relaxed),
            categories: self.categories.read().clone(),
            errors: self.errors.read().clone(),
            circuit_transitions: self.circuit_transitions.read().clone(),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.total_fetches,
            &self.successful_fetches,
            &self.failed_fetches,
            &self.total_latency_ms,
            &self.cache_hits,
            &self.cache_misses,
            &self.retries,
            &self.total_retry_delay_ms,
            &self.rate_limit_waits,
            &self.total_rate_limit_wait_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.categories.write().clear();
        self.errors.write().clear();
        self.circuit_transitions.write().clear();
    }
}

impl std::fmt::Debug for DefaultMetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultMetricsCollector")
            .field("total_fetches", &self.total_fetches.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Forwards circuit breaker transitions into a [`MetricsCollector`].
pub struct CircuitMetricsHook {
    metrics: Arc<dyn MetricsCollector>,
}

impl CircuitMetricsHook {
    /// Creates a hook reporting to `metrics`.
    pub fn new(metrics: Arc<dyn MetricsCollector>) -> Self {
        Self { metrics }
    }
}

impl CircuitBreakerHook for CircuitMetricsHook {
    fn on_state_change(&self, old_state: CircuitState, new_state: CircuitState) {
        self.metrics.record_circuit_transition(old_state, new_state);
    }
}
