//! Sliding-window rate limiter with a FIFO wait queue.
//!
//! A request issued at `T` occupies one slot until `T + window`. Capacity is
//! `max_requests + burst_allowance`. Callers that find no free slot queue in
//! arrival order; a dispatcher task sleeps until the oldest timestamp leaves
//! the window and hands freed slots to the head of the queue.
//!
//! A grant is delivered with its timestamp. A caller that gives up closes its
//! channel first, so a grant either reaches it or is never issued; one that
//! arrives alongside a cancel is handed back to the queue.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::errors::{FetchError, FetchResult};
use crate::observability::MetricsCollector;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Steady-state requests per window.
    pub max_requests: u32,
    /// Sliding window length.
    pub window: Duration,
    /// Extra requests allowed on top of `max_requests` without queueing.
    pub burst_allowance: u32,
    /// How long a caller may wait in the queue.
    pub queue_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            burst_allowance: 5,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

impl RateLimiterConfig {
    /// Creates a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the steady-state request count.
    pub fn max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Sets the window length.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Sets the burst allowance.
    pub fn burst_allowance(mut self, burst: u32) -> Self {
        self.burst_allowance = burst;
        self
    }

    /// Sets the queue timeout.
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Total slots per window.
    pub fn capacity(&self) -> usize {
        self.max_requests as usize + self.burst_allowance as usize
    }

    /// Validates the configuration.
    pub fn validate(&self) -> FetchResult<()> {
        if self.max_requests == 0 {
            return Err(FetchError::configuration("max_requests must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(FetchError::configuration("rate limit window must be non-zero"));
        }
        Ok(())
    }
}

/// Read-only limiter status.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    /// Slots free right now.
    pub remaining: usize,
    /// Slots granted since creation or the last reset.
    pub total_issued: u64,
    /// True when no slot is free or callers are queued.
    pub is_limited: bool,
    /// Callers waiting in the queue.
    pub queued: usize,
    /// Time until the oldest slot frees, if the window is full.
    pub next_slot_in: Option<Duration>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Instant>,
}

struct RateWindow {
    timestamps: VecDeque<Instant>,
    waiters: VecDeque<Waiter>,
    total_issued: u64,
    next_waiter_id: u64,
    dispatcher_active: bool,
}

impl RateWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .timestamps
            .front()
            .is_some_and(|issued| *issued + window <= now)
        {
            self.timestamps.pop_front();
        }
    }

    fn issue(&mut self, now: Instant) {
        self.timestamps.push_back(now);
        self.total_issued += 1;
    }

    /// Hands free slots to queued waiters, oldest first. Waiters that have
    /// closed their channel are skipped without taking a slot.
    fn grant_waiters(&mut self, now: Instant, capacity: usize) {
        while self.timestamps.len() < capacity {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.tx.send(now).is_ok() {
                self.issue(now);
            }
        }
    }
}

struct LimiterInner {
    config: RateLimiterConfig,
    window: Mutex<RateWindow>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

/// Sliding-window rate limiter.
///
/// Cheap to clone; clones share one window.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// Creates a new rate limiter.
    ///
    /// The configuration is not validated here. A limiter with no capacity
    /// fails every [`acquire`](Self::acquire) with
    /// [`FetchError::Configuration`].
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a rate limiter that reports queue waits to `metrics`.
    pub fn with_metrics(config: RateLimiterConfig, metrics: Arc<dyn MetricsCollector>) -> Self {
        Self::build(config, Some(metrics))
    }

    fn build(config: RateLimiterConfig, metrics: Option<Arc<dyn MetricsCollector>>) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                config,
                window: Mutex::new(RateWindow {
                    timestamps: VecDeque::new(),
                    waiters: VecDeque::new(),
                    total_issued: 0,
                    next_waiter_id: 0,
                    dispatcher_active: false,
                }),
                metrics,
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    /// Takes a slot if the window has room. Never waits.
    pub fn try_acquire(&self) -> bool {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut window = self.inner.window.lock();
        window.prune(now, config.window);
        if window.timestamps.len() < config.capacity() {
            window.issue(now);
            true
        } else {
            false
        }
    }

    /// Waits for a slot.
    ///
    /// Returns at once when a slot is free and nobody is queued. Otherwise the
    /// caller joins the FIFO queue until granted, until `queue_timeout`
    /// elapses ([`FetchError::RateLimitTimeout`]), or until `cancel` fires
    /// ([`FetchError::Cancelled`]).
    #[instrument(skip(self, cancel))]
    pub async fn acquire(&self, cancel: &CancellationToken) -> FetchResult<()> {
        let config = &self.inner.config;
        let started = Instant::now();
        if config.capacity() == 0 {
            return Err(FetchError::configuration("rate limiter has no capacity"));
        }

        let (rx, id, spawn_dispatcher) = {
            let mut window = self.inner.window.lock();
            window.prune(started, config.window);
            if window.waiters.is_empty() && window.timestamps.len() < config.capacity() {
                window.issue(started);
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            let id = window.next_waiter_id;
            window.next_waiter_id += 1;
            window.waiters.push_back(Waiter { id, tx });

            let spawn_dispatcher = !window.dispatcher_active;
            window.dispatcher_active = true;
            (rx, id, spawn_dispatcher)
        };

        if spawn_dispatcher {
            tokio::spawn(dispatch(Arc::clone(&self.inner)));
        }

        let _guard = WaiterGuard {
            inner: &self.inner,
            id,
        };
        tracing::debug!(waiter = id, "Rate limit reached, queueing");

        let mut rx = rx;
        let deadline = started + config.queue_timeout;
        let result = tokio::select! {
            biased;
            granted = &mut rx => granted
                .map(|_| ())
                .map_err(|_| FetchError::cancelled("rate limiter reset")),
            () = cancel.cancelled() => {
                if let Some(issued_at) = take_grant(&mut rx) {
                    self.release(issued_at);
                }
                Err(FetchError::cancelled("rate limit wait cancelled"))
            }
            () = tokio::time::sleep_until(deadline) => {
                // A slot granted in the same instant still counts.
                if take_grant(&mut rx).is_some() {
                    Ok(())
                } else {
                    Err(FetchError::RateLimitTimeout {
                        waited: started.elapsed(),
                    })
                }
            }
        };

        let waited = started.elapsed();
        match &result {
            Ok(()) => {
                tracing::debug!(waiter = id, waited_ms = waited.as_millis(), "Rate limit slot granted");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_rate_limit_wait(waited);
                }
            }
            Err(err) => {
                tracing::warn!(waiter = id, waited_ms = waited.as_millis(), error = %err, "Rate limit wait failed");
            }
        }
        result
    }

    /// Gives back a slot granted at `issued_at` and offers it to the queue.
    fn release(&self, issued_at: Instant) {
        let config = &self.inner.config;
        let mut window = self.inner.window.lock();
        if let Some(pos) = window.timestamps.iter().rposition(|t| *t == issued_at) {
            window.timestamps.remove(pos);
        }
        window.total_issued = window.total_issued.saturating_sub(1);

        let now = Instant::now();
        window.prune(now, config.window);
        window.grant_waiters(now, config.capacity());
        tracing::debug!("Unused rate limit slot released");
    }

    /// Returns the current status. Does not prune or otherwise mutate.
    pub fn status(&self) -> RateLimitStatus {
        let config = &self.inner.config;
        let now = Instant::now();
        let window = self.inner.window.lock();

        let live = window
            .timestamps
            .iter()
            .filter(|issued| **issued + config.window > now);
        let occupancy = live.clone().count();
        let remaining = config.capacity().saturating_sub(occupancy);
        let next_slot_in = if remaining == 0 {
            live.min()
                .map(|oldest| (*oldest + config.window).saturating_duration_since(now))
        } else {
            None
        };

        RateLimitStatus {
            remaining,
            total_issued: window.total_issued,
            is_limited: remaining == 0 || !window.waiters.is_empty(),
            queued: window.waiters.len(),
            next_slot_in,
        }
    }

    /// Clears all timestamps and fails every queued caller with
    /// [`FetchError::Cancelled`].
    pub fn reset(&self) {
        let dropped = {
            let mut window = self.inner.window.lock();
            window.timestamps.clear();
            window.total_issued = 0;
            std::mem::take(&mut window.waiters)
        };
        if !dropped.is_empty() {
            tracing::info!(waiters = dropped.len(), "Rate limiter reset");
        }
        // Dropping the senders wakes the waiters.
        drop(dropped);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Closes `rx` and returns a grant that was sent before the close.
fn take_grant(rx: &mut oneshot::Receiver<Instant>) -> Option<Instant> {
    rx.close();
    rx.try_recv().ok()
}

/// Removes a waiter from the queue when its future completes or is dropped.
struct WaiterGuard<'a> {
    inner: &'a LimiterInner,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut window = self.inner.window.lock();
        window.waiters.retain(|waiter| waiter.id != self.id);
    }
}

/// Grants freed slots to queued waiters, oldest first.
///
/// Exits once the queue is empty; the next caller to queue starts a new one.
async fn dispatch(inner: Arc<LimiterInner>) {
    let config = &inner.config;
    loop {
        let wake_at = {
            let mut window = inner.window.lock();
            let now = Instant::now();
            window.prune(now, config.window);
            window.grant_waiters(now, config.capacity());

            if window.waiters.is_empty() {
                window.dispatcher_active = false;
                return;
            }

            match window.timestamps.front() {
                Some(oldest) => *oldest + config.window,
                None => {
                    window.dispatcher_active = false;
                    return;
                }
            }
        };

        tokio::time::sleep_until(wake_at).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64, burst: u32) -> RateLimiter {
        RateLimiter::new(
            RateLimiterConfig::new()
                .max_requests(max)
                .window(Duration::from_millis(window_ms))
                .burst_allowance(burst)
                .queue_timeout(Duration::from_secs(30)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_respects_capacity() {
        let limiter = limiter(2, 1000, 1);

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_read_only() {
        let limiter = limiter(2, 1000, 0);
        limiter.try_acquire();
        limiter.try_acquire();

        let status = limiter.status();
        assert_eq!(status.remaining, 0);
        assert_eq!(status.total_issued, 2);
        assert!(status.is_limited);
        assert_eq!(status.next_slot_in, Some(Duration::from_millis(1000)));

        tokio::time::advance(Duration::from_millis(1500)).await;
        let status = limiter.status();
        assert_eq!(status.remaining, 2);
        assert!(!status.is_limited);
        assert_eq!(limiter.inner.window.lock().timestamps.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new()
                .max_requests(1)
                .window(Duration::from_secs(60))
                .burst_allowance(0)
                .queue_timeout(Duration::from_secs(2)),
        );
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let result = limiter.acquire(&cancel).await;
        match result {
            Err(FetchError::RateLimitTimeout { waited }) => {
                assert_eq!(waited, Duration::from_secs(2));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(limiter.status().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_queued() {
        let limiter = limiter(1, 60_000, 0);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let token = waiter_cancel.clone();
            tokio::spawn(async move { limiter.acquire(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(limiter.status().queued, 1);

        waiter_cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(FetchError::Cancelled { .. })));
        assert_eq!(limiter.status().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_fails_waiters() {
        let limiter = limiter(1, 60_000, 0);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        limiter.reset();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(FetchError::Cancelled { .. })));

        let status = limiter.status();
        assert_eq!(status.total_issued, 0);
        assert_eq!(status.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_waiter_is_skipped_without_taking_a_slot() {
        let limiter = limiter(1, 60_000, 0);
        let (tx, mut rx) = oneshot::channel();
        rx.close();

        let mut window = limiter.inner.window.lock();
        window.waiters.push_back(Waiter { id: 7, tx });
        window.grant_waiters(Instant::now(), 1);
        assert!(window.waiters.is_empty());
        assert!(window.timestamps.is_empty());
        assert_eq!(window.total_issued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_taken_after_cancel_is_released() {
        let limiter = limiter(1, 60_000, 0);
        let (tx, mut rx) = oneshot::channel();
        {
            let mut window = limiter.inner.window.lock();
            window.waiters.push_back(Waiter { id: 7, tx });
            window.grant_waiters(Instant::now(), 1);
        }
        assert_eq!(limiter.status().remaining, 0);

        let issued_at = take_grant(&mut rx).unwrap();
        limiter.release(issued_at);

        let status = limiter.status();
        assert_eq!(status.remaining, 1);
        assert_eq!(status.total_issued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_slot_goes_to_next_waiter() {
        let limiter = limiter(1, 60_000, 0);
        limiter.acquire(&CancellationToken::new()).await.unwrap();
        let started = Instant::now();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(limiter.status().queued, 1);

        let issued_at = *limiter.inner.window.lock().timestamps.front().unwrap();
        limiter.release(issued_at);

        waiter.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.status().remaining, 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_fails_fast() {
        let limiter = limiter(0, 1000, 0);
        let result = limiter.acquire(&CancellationToken::new()).await;
        assert!(matches!(result, Err(FetchError::Configuration { .. })));
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimiterConfig::default().validate().is_ok());
        assert!(RateLimiterConfig::new().max_requests(0).validate().is_err());
        assert!(RateLimiterConfig::new().window(Duration::ZERO).validate().is_err());
    }
}
