//! TTL cache with single-flight population.
//!
//! Concurrent misses for one key share a single factory call. The first
//! caller registers an in-flight marker holding a weak handle to a shared
//! future; later callers upgrade the handle and await the same result. The
//! shared future stores its value and retires the marker itself, so a caller
//! that stops waiting never strands the others. The last waiter to leave an
//! unfinished flight retires its marker on the way out.
//!
//! Expired entries are evicted lazily: a miss drops the key's own expired
//! entry, and at most once per `sweep_interval` a miss sweeps the whole map.
//!
//! Lock order is `in_flight`, `entries`, then `last_sweep`. None of them is
//! held across an await.

mod policy;

pub use policy::CacheConfig;

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::errors::{FetchError, FetchResult};
use crate::types::DataCategory;

/// Percent-escapes the key separators `%`, `:` and `=`.
pub fn escape_key_component(component: &str) -> Cow<'_, str> {
    if !component.contains(['%', ':', '=']) {
        return Cow::Borrowed(component);
    }
    let mut escaped = String::with_capacity(component.len() + 6);
    for c in component.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            '=' => escaped.push_str("%3D"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

type CachedValue = Arc<dyn Any + Send + Sync>;
type FlightResult = Result<CachedValue, FetchError>;
type FlightFuture = BoxFuture<'static, FlightResult>;

struct CacheEntry {
    value: CachedValue,
    category: DataCategory,
    expires_at: Instant,
    created_at: Instant,
}

struct InFlight {
    id: u64,
    flight: WeakShared<FlightFuture>,
}

struct CacheInner {
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    next_flight_id: AtomicU64,
    last_sweep: Mutex<Instant>,
}

/// One caller's handle on a flight.
///
/// Dropping the last handle before the flight finishes removes its marker.
struct FlightWaiter<'a> {
    inner: &'a CacheInner,
    key: &'a str,
    id: u64,
    flight: Shared<FlightFuture>,
}

impl Drop for FlightWaiter<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        // Joiners upgrade under this lock, so the count cannot grow here.
        let last_waiter = self.flight.strong_count() == Some(1);
        if last_waiter && in_flight.get(self.key).is_some_and(|f| f.id == self.id) {
            in_flight.remove(self.key);
            tracing::debug!(key = self.key, "Abandoned fetch retired");
        }
    }
}

/// Cache counters. Reading them has no side effects.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Lookups answered from a stored entry.
    pub hits: u64,
    /// Lookups that started a factory call.
    pub misses: u64,
    /// Lookups that joined another caller's factory call.
    pub coalesced: u64,
    /// Stored entries, including expired ones not yet evicted.
    pub entries: usize,
    /// Factory calls currently running.
    pub in_flight: usize,
}

/// Information about one stored entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    /// Category the entry was stored under.
    pub category: DataCategory,
    /// Time since the entry was stored.
    pub age: Duration,
    /// Time until the entry expires; zero once expired.
    pub time_to_live: Duration,
}

/// Result of [`CacheLayer::warm`].
#[derive(Debug, Default)]
pub struct WarmReport {
    /// Keys now present in the cache.
    pub warmed: usize,
    /// Keys whose loader failed.
    pub failed: Vec<(String, FetchError)>,
    /// Keys not attempted because warming is disabled.
    pub skipped: usize,
}

/// Type-erased TTL cache shared by all fetches.
///
/// Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct CacheLayer {
    inner: Arc<CacheInner>,
}

impl CacheLayer {
    /// Creates a new cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                next_flight_id: AtomicU64::new(0),
                last_sweep: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Builds a cache key: `operation[:p1[:p2...]]`.
    ///
    /// Each component is escaped with [`escape_key_component`], so `["a:b"]`
    /// and `["a", "b"]` produce different keys.
    pub fn generate_key<S: AsRef<str>>(operation: &str, params: &[S]) -> String {
        let mut key = escape_key_component(operation).into_owned();
        for param in params {
            key.push(':');
            key.push_str(&escape_key_component(param.as_ref()));
        }
        key
    }

    /// Returns the cached value for `key`, or runs `factory` once for all
    /// concurrent callers and caches its value.
    ///
    /// The value is stored for `ttl_override` or the category TTL. A factory
    /// failure reaches every joined caller and nothing is stored. Cancelling
    /// `cancel` abandons this caller's wait only.
    #[instrument(skip(self, category, cancel, factory), fields(category = %category))]
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        category: DataCategory,
        ttl_override: Option<Duration>,
        cancel: &CancellationToken,
        factory: F,
    ) -> FetchResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        if let Some(value) = self.lookup::<T>(key) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let mut waiter = {
            let mut in_flight = self.inner.in_flight.lock();

            // Another caller may have stored the value since the first check.
            if let Some(value) = self.lookup::<T>(key) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }

            let joined = in_flight
                .get(key)
                .and_then(|f| f.flight.upgrade().map(|flight| (f.id, flight)));
            if let Some((id, flight)) = joined {
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Joining in-flight fetch");
                FlightWaiter {
                    inner: &self.inner,
                    key,
                    id,
                    flight,
                }
            } else {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                self.evict_expired(&mut in_flight, key);
                let id = self.inner.next_flight_id.fetch_add(1, Ordering::Relaxed);
                let ttl = ttl_override.unwrap_or_else(|| self.inner.config.ttl_for(category));
                let flight = self.start_flight(key, id, category, ttl, factory());
                if let Some(weak) = flight.downgrade() {
                    in_flight.insert(key.to_string(), InFlight { id, flight: weak });
                }
                FlightWaiter {
                    inner: &self.inner,
                    key,
                    id,
                    flight,
                }
            }
        };

        let value = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::cancelled("cache wait cancelled")),
            result = &mut waiter.flight => result?,
        };

        value.downcast_ref::<T>().cloned().ok_or_else(|| {
            FetchError::configuration(format!(
                "in-flight value for key '{key}' has a different type"
            ))
        })
    }

    fn start_flight<T, Fut>(
        &self,
        key: &str,
        id: u64,
        category: DataCategory,
        ttl: Duration,
        fut: Fut,
    ) -> Shared<FlightFuture>
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();

        async move {
            let result = fut.await;

            let mut in_flight = inner.in_flight.lock();
            let owns_marker = in_flight.get(&key).is_some_and(|f| f.id == id);
            if owns_marker {
                in_flight.remove(&key);
            }

            let value: CachedValue = Arc::new(result?);
            if !owns_marker {
                tracing::debug!(key = %key, "Key invalidated during fetch; not storing");
            } else if !ttl.is_zero() {
                let now = Instant::now();
                inner.entries.write().insert(
                    key,
                    CacheEntry {
                        value: Arc::clone(&value),
                        category,
                        expires_at: now + ttl,
                        created_at: now,
                    },
                );
            }
            Ok(value)
        }
        .boxed()
        .shared()
    }

    /// Drops the expired entry for `key`, and sweeps every expired entry and
    /// stale marker when `sweep_interval` has passed since the last sweep.
    fn evict_expired(&self, in_flight: &mut HashMap<String, InFlight>, key: &str) {
        let now = Instant::now();
        let mut entries = self.inner.entries.write();
        if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
            entries.remove(key);
        }

        let mut last_sweep = self.inner.last_sweep.lock();
        if now.saturating_duration_since(*last_sweep) < self.inner.config.sweep_interval {
            return;
        }
        *last_sweep = now;

        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let evicted = before - entries.len();
        in_flight.retain(|_, f| f.flight.upgrade().is_some());
        tracing::debug!(evicted, "Expired cache entries swept");
    }

    fn lookup<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let entries = self.inner.entries.read();
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        let value = entry.value.downcast_ref::<T>().cloned();
        if value.is_none() {
            tracing::warn!(key, "Cached value has a different type; treating as miss");
        }
        value
    }

    /// Returns the cached value without populating on a miss.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let value = self.lookup::<T>(key);
        let counter = if value.is_some() {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Returns true if an unexpired entry exists for `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.inner
            .entries
            .read()
            .get(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    /// Returns details about the entry for `key`.
    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let now = Instant::now();
        self.inner.entries.read().get(key).map(|entry| EntryInfo {
            category: entry.category,
            age: now.saturating_duration_since(entry.created_at),
            time_to_live: entry.expires_at.saturating_duration_since(now),
        })
    }

    /// Removes `key`. A fetch already running for it will not store its value.
    pub fn remove(&self, key: &str) -> bool {
        let mut in_flight = self.inner.in_flight.lock();
        in_flight.remove(key);
        let removed = self.inner.entries.write().remove(key).is_some();
        drop(in_flight);
        if removed {
            tracing::debug!(key, "Cache entry removed");
        }
        removed
    }

    /// Removes every key matching `pattern` and returns how many entries
    /// were dropped.
    ///
    /// Matching in-flight fetches are retired under the same lock, so none of
    /// them can store a value after this returns.
    pub fn remove_by_pattern(&self, pattern: &str) -> FetchResult<usize> {
        let re = Regex::new(pattern)?;

        let mut in_flight = self.inner.in_flight.lock();
        in_flight.retain(|key, _| !re.is_match(key));

        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !re.is_match(key));
        let removed = before - entries.len();

        drop(entries);
        drop(in_flight);
        tracing::info!(pattern, removed, "Cache entries invalidated");
        Ok(removed)
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Drops every entry and in-flight marker.
    pub fn clear(&self) {
        let mut in_flight = self.inner.in_flight.lock();
        in_flight.clear();
        self.inner.entries.write().clear();
    }

    /// Returns the current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            entries: self.inner.entries.read().len(),
            in_flight: self.inner.in_flight.lock().len(),
        }
    }

    /// Populates `keys` through `loader`, concurrently.
    ///
    /// Does nothing beyond logging when warming is disabled.
    pub async fn warm<T, F, Fut>(
        &self,
        keys: Vec<String>,
        category: DataCategory,
        cancel: &CancellationToken,
        loader: F,
    ) -> WarmReport
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(String) -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        if !self.inner.config.warming_enabled {
            tracing::info!(keys = keys.len(), "Cache warming disabled; skipping");
            return WarmReport {
                skipped: keys.len(),
                ..Default::default()
            };
        }

        let loads = keys.into_iter().map(|key| {
            let load = loader(key.clone());
            async move {
                let result = self
                    .get_or_set::<T, _, _>(&key, category, None, cancel, move || load)
                    .await;
                (key, result)
            }
        });

        let mut report = WarmReport::default();
        for (key, result) in futures::future::join_all(loads).await {
            match result {
                Ok(_) => report.warmed += 1,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "Cache warming failed for key");
                    report.failed.push((key, err));
                }
            }
        }
        tracing::info!(
            warmed = report.warmed,
            failed = report.failed.len(),
            "Cache warming finished"
        );
        report
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}
