//! Configuration for the sports data client.
//!
//! Bundles the API credentials with the settings of every pipeline
//! component. Built with [`SportsDataConfig::builder`] or read from the
//! environment with [`SportsDataConfig::from_env`].

use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use url::Url;

use crate::bulk::BulkConfig;
use crate::cache::CacheConfig;
use crate::errors::{FetchError, FetchResult};
use crate::resilience::{RateLimiterConfig, ResilienceConfig};

/// Default base URL for the upstream API.
pub const DEFAULT_BASE_URL: &str = "https://api.sportsdata.io/v3";

/// Default request timeout (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the sports data client.
#[derive(Clone)]
pub struct SportsDataConfig {
    pub(crate) api_key: SecretString,
    /// Base URL for upstream requests, without a trailing slash.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Rate limiter settings.
    pub rate_limit: RateLimiterConfig,
    /// Retry and circuit breaker settings.
    pub resilience: ResilienceConfig,
    /// Cache settings.
    pub cache: CacheConfig,
    /// Bulk processing defaults.
    pub bulk: BulkConfig,
}

impl SportsDataConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SportsDataConfigBuilder {
        SportsDataConfigBuilder::new()
    }

    /// Creates a configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SPORTSDATA_API_KEY` (required): API key
    /// - `SPORTSDATA_BASE_URL`: custom base URL
    /// - `SPORTSDATA_TIMEOUT_SECS`: request timeout in seconds
    /// - `SPORTSDATA_MAX_REQUESTS`: requests allowed per window
    /// - `SPORTSDATA_WINDOW_SECS`: rate limit window in seconds
    /// - `SPORTSDATA_BURST`: extra requests allowed per window
    /// - `SPORTSDATA_QUEUE_TIMEOUT_SECS`: longest wait for a rate limit slot
    /// - `SPORTSDATA_MAX_RETRIES`: retries after the first attempt
    /// - `SPORTSDATA_CACHE_WARMING`: `true` or `false`
    ///
    /// Optional values that are set but do not parse are rejected.
    pub fn from_env() -> FetchResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<L>(lookup: L) -> FetchResult<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("SPORTSDATA_API_KEY").ok_or_else(|| {
            FetchError::configuration("SPORTSDATA_API_KEY environment variable not set")
        })?;

        let mut builder = SportsDataConfigBuilder::new().api_key(api_key);

        if let Some(base_url) = lookup("SPORTSDATA_BASE_URL") {
            builder = builder.base_url(base_url);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "SPORTSDATA_TIMEOUT_SECS")? {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        let mut rate_limit = RateLimiterConfig::default();
        if let Some(max) = parse_var(&lookup, "SPORTSDATA_MAX_REQUESTS")? {
            rate_limit = rate_limit.max_requests(max);
        }
        if let Some(secs) = parse_var(&lookup, "SPORTSDATA_WINDOW_SECS")? {
            rate_limit = rate_limit.window(Duration::from_secs(secs));
        }
        if let Some(burst) = parse_var(&lookup, "SPORTSDATA_BURST")? {
            rate_limit = rate_limit.burst_allowance(burst);
        }
        if let Some(secs) = parse_var(&lookup, "SPORTSDATA_QUEUE_TIMEOUT_SECS")? {
            rate_limit = rate_limit.queue_timeout(Duration::from_secs(secs));
        }
        builder = builder.rate_limit(rate_limit);

        if let Some(retries) = parse_var::<u32, _>(&lookup, "SPORTSDATA_MAX_RETRIES")? {
            builder = builder.max_retries(retries);
        }
        if let Some(enabled) = parse_var(&lookup, "SPORTSDATA_CACHE_WARMING")? {
            builder = builder.cache(CacheConfig::default().warming_enabled(enabled));
        }

        builder.build()
    }

    pub(crate) fn api_key(&self) -> &SecretString {
        &self.api_key
    }

    /// Returns the last four characters of the API key for diagnostics.
    pub fn api_key_hint(&self) -> String {
        crate::auth::key_hint(self.api_key.expose_secret())
    }
}

fn parse_var<T, L>(lookup: &L, name: &str) -> FetchResult<Option<T>>
where
    T: std::str::FromStr,
    L: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            FetchError::configuration(format!("{name} has an invalid value: '{raw}'"))
        }),
    }
}

impl std::fmt::Debug for SportsDataConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SportsDataConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("rate_limit", &self.rate_limit)
            .field("resilience", &self.resilience)
            .field("cache", &self.cache)
            .field("bulk", &self.bulk)
            .finish()
    }
}

/// Builder for [`SportsDataConfig`].
#[derive(Default)]
pub struct SportsDataConfigBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
    rate_limit: Option<RateLimiterConfig>,
    resilience: Option<ResilienceConfig>,
    cache: Option<CacheConfig>,
    bulk: Option<BulkConfig>,
}

impl SportsDataConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the API key.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets how many times a transient failure is retried.
    ///
    /// Applied on top of the resilience settings.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the rate limiter configuration.
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Sets the resilience configuration.
    pub fn resilience(mut self, config: ResilienceConfig) -> Self {
        self.resilience = Some(config);
        self
    }

    /// Sets the cache configuration.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Sets the bulk processing defaults.
    pub fn bulk(mut self, config: BulkConfig) -> Self {
        self.bulk = Some(config);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> FetchResult<SportsDataConfig> {
        let api_key = self
            .api_key
            .ok_or_else(|| FetchError::configuration("API key is required"))?;
        if api_key.trim().is_empty() {
            return Err(FetchError::configuration("API key cannot be empty"));
        }

        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let parsed = Url::parse(&base_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::configuration(format!(
                "Base URL must use http or https, got '{}'",
                parsed.scheme()
            )));
        }
        if parsed.scheme() == "http" {
            tracing::warn!("Base URL does not use HTTPS; the API key will be sent in clear text");
        }

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        if timeout.is_zero() {
            return Err(FetchError::configuration("timeout must be greater than zero"));
        }

        let rate_limit = self.rate_limit.unwrap_or_default();
        rate_limit.validate()?;

        let mut resilience = self.resilience.unwrap_or_default();
        if let Some(retries) = self.max_retries {
            resilience.retry = resilience.retry.max_attempts(retries.saturating_add(1));
        }
        resilience.validate()?;

        let bulk = self.bulk.unwrap_or_default();
        if bulk.batch_size == 0 || bulk.max_concurrency == 0 {
            return Err(FetchError::configuration(
                "bulk batch_size and max_concurrency must be at least 1",
            ));
        }

        Ok(SportsDataConfig {
            api_key: SecretString::new(api_key),
            base_url,
            timeout,
            rate_limit,
            resilience,
            cache: self.cache.unwrap_or_default(),
            bulk,
        })
    }
}
