//! Sports data client.
//!
//! Composes the fetch pipeline: cache, then resilience executor, then rate
//! limiter, then upstream. One instance of each component is shared by every
//! call made through a client and its clones.

use bytes::Bytes;
use secrecy::ExposeSecret;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::auth::{ApiKeyAuth, AuthProvider};
use crate::bulk::{BulkConfig, BulkOptions, BulkOrchestrator, BulkOutcome, ProgressObserver};
use crate::cache::{CacheConfig, CacheLayer, CacheStats, WarmReport};
use crate::config::{SportsDataConfig, SportsDataConfigBuilder};
use crate::errors::{FetchError, FetchResult};
use crate::observability::{DefaultMetricsCollector, FetchMetrics, MetricsCollector};
use crate::resilience::{
    classify, CircuitSnapshot, OperationOutcome, RateLimitStatus, RateLimiter, RateLimiterConfig,
    ResilienceConfig, ResilienceExecutor,
};
use crate::transport::{HttpUpstream, UpstreamSource};
use crate::types::FetchRequest;

/// Read-only view of every pipeline component.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Rate limiter status.
    pub rate_limit: RateLimitStatus,
    /// Circuit breaker status.
    pub circuit: CircuitSnapshot,
    /// Cache counters.
    pub cache: CacheStats,
}

/// The uncached path: retry and breaker around limiter and upstream.
#[derive(Clone)]
struct Pipeline {
    limiter: RateLimiter,
    executor: ResilienceExecutor,
    upstream: Arc<dyn UpstreamSource>,
    retryable_status_codes: Arc<[u16]>,
}

impl Pipeline {
    async fn run(&self, path: &str) -> FetchResult<Bytes> {
        // The flight outlives any single caller, so it gets its own token.
        // Dropping the flight drops the upstream request with it.
        let flight = CancellationToken::new();
        let this = self;
        let flight_ref = &flight;

        self.executor
            .execute(&flight, move || async move {
                if let Err(err) = this.limiter.acquire(flight_ref).await {
                    return OperationOutcome::failure(err);
                }
                classify(
                    this.upstream.fetch(path, flight_ref).await,
                    &this.retryable_status_codes,
                )
            })
            .await
    }
}

/// Resilient, cached client for a rate-limited sports data API.
///
/// Cheap to clone; clones share the cache, limiter, breaker and metrics.
///
/// # Example
///
/// ```rust,no_run
/// use sportsdata_client::{DataCategory, FetchRequest, SportsDataClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = SportsDataClient::builder()
///         .api_key("your-subscription-key")
///         .build()?;
///
///     let request = FetchRequest::builder("teams")
///         .endpoint("nfl/scores/json/Teams")
///         .category(DataCategory::Team)
///         .build()?;
///
///     let body = client.fetch(&request).await?;
///     println!("{} bytes", body.len());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct SportsDataClient {
    config: Arc<SportsDataConfig>,
    pipeline: Pipeline,
    cache: CacheLayer,
    bulk: BulkOrchestrator,
    metrics: Arc<dyn MetricsCollector>,
}

impl SportsDataClient {
    /// Creates a new client builder.
    pub fn builder() -> SportsDataClientBuilder {
        SportsDataClientBuilder::new()
    }

    /// Creates a client from environment variables.
    ///
    /// See [`SportsDataConfig::from_env`] for the variables read.
    pub fn from_env() -> FetchResult<Self> {
        Self::from_config(SportsDataConfig::from_env()?)
    }

    /// Creates a client from a validated configuration.
    pub fn from_config(config: SportsDataConfig) -> FetchResult<Self> {
        SportsDataClientBuilder::from_config(config).build()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SportsDataConfig {
        &self.config
    }

    /// Returns the shared cache.
    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// Returns the shared rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.pipeline.limiter
    }

    /// Returns the shared resilience executor.
    pub fn executor(&self) -> &ResilienceExecutor {
        &self.pipeline.executor
    }

    /// Fetches one request, serving it from the cache when possible.
    pub async fn fetch(&self, request: &FetchRequest) -> FetchResult<Bytes> {
        self.fetch_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Fetches one request; `cancel` abandons this caller's wait.
    ///
    /// Concurrent fetches of the same request share one upstream call.
    #[instrument(skip_all, fields(operation = request.operation(), category = %request.category()))]
    pub async fn fetch_with_cancel(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> FetchResult<Bytes> {
        let started = Instant::now();
        let ran_upstream = Arc::new(AtomicBool::new(false));

        let factory = {
            let pipeline = self.pipeline.clone();
            let path = request.path_and_query();
            let ran_upstream = Arc::clone(&ran_upstream);
            move || async move {
                ran_upstream.store(true, Ordering::Relaxed);
                pipeline.run(&path).await
            }
        };

        let result = self
            .cache
            .get_or_set(
                &request.cache_key(),
                request.category(),
                request.ttl_override(),
                cancel,
                factory,
            )
            .await;

        let elapsed = started.elapsed();
        self.metrics
            .record_fetch(request.category(), result.is_ok(), elapsed);
        match &result {
            Ok(body) => {
                let from_cache = !ran_upstream.load(Ordering::Relaxed);
                self.metrics.record_cache(from_cache);
                tracing::debug!(
                    from_cache,
                    bytes = body.len(),
                    elapsed_ms = elapsed.as_millis(),
                    "Fetch completed"
                );
            }
            Err(err) => {
                self.metrics.record_error(err.kind());
                tracing::warn!(
                    error = %err,
                    kind = %err.kind(),
                    elapsed_ms = elapsed.as_millis(),
                    "Fetch failed"
                );
            }
        }
        result
    }

    /// Fetches many requests under the bulk concurrency bound.
    ///
    /// `options` defaults to the configured [`BulkConfig`].
    pub async fn fetch_many(
        &self,
        requests: Vec<FetchRequest>,
        options: Option<BulkOptions>,
        observer: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> FetchResult<BulkOutcome<(FetchRequest, Bytes)>> {
        let options = options.unwrap_or_else(|| self.bulk.options());
        let client = self;

        self.bulk
            .process_in_batches(
                requests,
                &options,
                move |request: FetchRequest, token| async move {
                    let body = client.fetch_with_cancel(&request, &token).await?;
                    Ok((request, body))
                },
                observer,
                cancel,
            )
            .await
    }

    /// Drops the cached value for `key`.
    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.remove(key)
    }

    /// Drops the cached value for `request`.
    pub fn invalidate_request(&self, request: &FetchRequest) -> bool {
        self.cache.remove(&request.cache_key())
    }

    /// Drops every cached value whose key matches `pattern`.
    pub fn invalidate_matching(&self, pattern: &str) -> FetchResult<usize> {
        self.cache.remove_by_pattern(pattern)
    }

    /// Pre-populates the cache with `requests`.
    ///
    /// Requests already cached cost nothing. Does nothing when warming is
    /// disabled in the cache configuration.
    pub async fn warm(
        &self,
        requests: Vec<FetchRequest>,
        cancel: &CancellationToken,
    ) -> WarmReport {
        if !self.cache.config().warming_enabled {
            tracing::info!(requests = requests.len(), "Cache warming disabled; skipping");
            return WarmReport {
                skipped: requests.len(),
                ..Default::default()
            };
        }

        let loads = requests.into_iter().map(|request| async move {
            let result = self.fetch_with_cancel(&request, cancel).await;
            (request.cache_key(), result)
        });

        let mut report = WarmReport::default();
        for (key, result) in futures::future::join_all(loads).await {
            match result {
                Ok(_) => report.warmed += 1,
                Err(err) => report.failed.push((key, err)),
            }
        }
        tracing::info!(
            warmed = report.warmed,
            failed = report.failed.len(),
            "Cache warming finished"
        );
        report
    }

    /// Returns a read-only snapshot of the pipeline.
    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            rate_limit: self.pipeline.limiter.status(),
            circuit: self.pipeline.executor.circuit_status(),
            cache: self.cache.stats(),
        }
    }

    /// Returns the collected metrics.
    pub fn metrics(&self) -> FetchMetrics {
        self.metrics.get_metrics()
    }
}

impl std::fmt::Debug for SportsDataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SportsDataClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SportsDataClient`].
#[derive(Default)]
pub struct SportsDataClientBuilder {
    config_builder: SportsDataConfigBuilder,
    upstream: Option<Arc<dyn UpstreamSource>>,
    auth: Option<Arc<dyn AuthProvider>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl SportsDataClientBuilder {
    /// Creates a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder from an existing configuration.
    pub fn from_config(config: SportsDataConfig) -> Self {
        Self {
            config_builder: SportsDataConfigBuilder::new()
                .api_key(config.api_key().expose_secret().clone())
                .base_url(config.base_url)
                .timeout(config.timeout)
                .rate_limit(config.rate_limit)
                .resilience(config.resilience)
                .cache(config.cache)
                .bulk(config.bulk),
            ..Self::default()
        }
    }

    /// Sets the API key.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.api_key(api_key);
        self
    }

    /// Sets the base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.base_url(base_url);
        self
    }

    /// Sets the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config_builder = self.config_builder.timeout(timeout);
        self
    }

    /// Sets how many times a transient failure is retried.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config_builder = self.config_builder.max_retries(retries);
        self
    }

    /// Sets the rate limiter configuration.
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.config_builder = self.config_builder.rate_limit(config);
        self
    }

    /// Sets the resilience configuration.
    pub fn resilience(mut self, config: ResilienceConfig) -> Self {
        self.config_builder = self.config_builder.resilience(config);
        self
    }

    /// Sets the cache configuration.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.config_builder = self.config_builder.cache(config);
        self
    }

    /// Sets the bulk processing defaults.
    pub fn bulk(mut self, config: BulkConfig) -> Self {
        self.config_builder = self.config_builder.bulk(config);
        self
    }

    /// Sets a custom upstream source.
    pub fn upstream(mut self, upstream: Arc<dyn UpstreamSource>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Sets a custom auth provider.
    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sets a custom metrics collector.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the client.
    pub fn build(self) -> FetchResult<SportsDataClient> {
        let config = self.config_builder.build()?;

        let auth = self
            .auth
            .unwrap_or_else(|| Arc::new(ApiKeyAuth::new(config.api_key().clone())));
        auth.validate()?;

        let upstream: Arc<dyn UpstreamSource> = match self.upstream {
            Some(upstream) => upstream,
            None => Arc::new(
                HttpUpstream::new(config.base_url.clone(), config.timeout, auth).map_err(
                    |e| FetchError::configuration(format!("failed to build HTTP client: {e}")),
                )?,
            ),
        };

        let metrics: Arc<dyn MetricsCollector> = self
            .metrics
            .unwrap_or_else(|| Arc::new(DefaultMetricsCollector::new()));

        let pipeline = Pipeline {
            limiter: RateLimiter::with_metrics(config.rate_limit.clone(), Arc::clone(&metrics)),
            executor: ResilienceExecutor::with_metrics(&config.resilience, Arc::clone(&metrics)),
            upstream,
            retryable_status_codes: config.resilience.retryable_status_codes.clone().into(),
        };

        tracing::info!(
            base_url = %config.base_url,
            api_key = %config.api_key_hint(),
            max_requests = config.rate_limit.max_requests,
            "Sports data client initialized"
        );

        Ok(SportsDataClient {
            cache: CacheLayer::new(config.cache.clone()),
            bulk: BulkOrchestrator::new(config.bulk.clone()),
            config: Arc::new(config),
            pipeline,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockUpstream;
    use crate::types::{DataCategory, RawResponse};

    fn client_with(upstream: Arc<MockUpstream>) -> SportsDataClient {
        SportsDataClient::builder()
            .api_key("test-key-1234")
            .resilience(ResilienceConfig {
                retry: crate::resilience::RetryConfig::new()
                    .base_delay(Duration::from_millis(10))
                    .jitter(false),
                ..Default::default()
            })
            .upstream(upstream)
            .build()
            .unwrap()
    }

    fn request(id: u32) -> FetchRequest {
        FetchRequest::builder("player")
            .endpoint("nfl/scores/json/Player")
            .param("id", id)
            .category(DataCategory::Player)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_caches_body() {
        let upstream = Arc::new(MockUpstream::new());
        upstream.queue_response(RawResponse::new(200, "{\"PlayerID\":1}"));
        let client = client_with(Arc::clone(&upstream));

        let first = client.fetch(&request(1)).await.unwrap();
        let second = client.fetch(&request(1)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(upstream.call_count(), 1);
        assert_eq!(upstream.paths(), vec!["/nfl/scores/json/Player?id=1"]);

        let metrics = client.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.successful_fetches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let upstream = Arc::new(MockUpstream::new());
        upstream.queue_response(RawResponse::new(503, "busy"));
        upstream.queue_response(RawResponse::new(200, "ok"));
        let client = client_with(Arc::clone(&upstream));

        let body = client.fetch(&request(2)).await.unwrap();

        assert_eq!(body, Bytes::from("ok"));
        assert_eq!(upstream.call_count(), 2);
        assert_eq!(client.metrics().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_not_cached() {
        let upstream = Arc::new(MockUpstream::new());
        upstream.queue_response(RawResponse::new(404, "missing"));
        upstream.queue_response(RawResponse::new(200, "found"));
        let client = client_with(Arc::clone(&upstream));

        let err = client.fetch(&request(3)).await.unwrap_err();
        assert_eq!(err.status_code(), Some(404));

        let body = client.fetch(&request(3)).await.unwrap();
        assert_eq!(body, Bytes::from("found"));
        assert_eq!(upstream.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refetch() {
        let upstream = Arc::new(MockUpstream::new());
        upstream.set_default(RawResponse::new(200, "body"));
        let client = client_with(Arc::clone(&upstream));

        client.fetch(&request(4)).await.unwrap();
        assert!(client.invalidate_request(&request(4)));
        client.fetch(&request(4)).await.unwrap();

        assert_eq!(upstream.call_count(), 2);
        assert_eq!(client.invalidate_matching("^player:").unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_read_only() {
        let upstream = Arc::new(MockUpstream::new());
        upstream.set_default(RawResponse::new(200, "body"));
        let client = client_with(upstream);

        client.fetch(&request(5)).await.unwrap();
        let first = client.status();
        let second = client.status();

        assert_eq!(first.rate_limit.total_issued, 1);
        assert_eq!(second.rate_limit.total_issued, 1);
        assert_eq!(first.cache.entries, 1);
        assert_eq!(second.cache.misses, first.cache.misses);
    }

    #[test]
    fn test_from_config_keeps_settings() {
        let config = SportsDataConfig::builder()
            .api_key("test-key-1234")
            .base_url("http://localhost:9000")
            .max_retries(0)
            .build()
            .unwrap();

        let client = SportsDataClient::from_config(config).unwrap();

        assert_eq!(client.config().base_url, "http://localhost:9000");
        assert_eq!(client.config().resilience.retry.max_attempts, 1);
        assert_eq!(client.config().api_key_hint(), "...1234");
    }

    #[test]
    fn test_build_requires_api_key() {
        let result = SportsDataClient::builder().build();
        assert!(matches!(result, Err(FetchError::Configuration { .. })));
    }
}
