//! Resilience patterns for the fetch pipeline.
//!
//! - [`RateLimiter`]: sliding-window admission control with a FIFO queue.
//! - [`ResilienceExecutor`]: classified retry guarded by a [`CircuitBreaker`].
//! - [`classify`]: the single place where transport results become
//!   [`OperationOutcome`]s.

mod circuit_breaker;
mod executor;
mod outcome;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerHook, CircuitSnapshot,
    CircuitState,
};
pub use executor::ResilienceExecutor;
pub use outcome::{classify, parse_retry_after, OperationOutcome, DEFAULT_RETRYABLE_STATUS_CODES};
pub use rate_limiter::{RateLimitStatus, RateLimiter, RateLimiterConfig};
pub use retry::{RetryConfig, RetryPolicy};

use crate::errors::{FetchError, FetchResult};

/// Resilience configuration.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Circuit breaker configuration.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Status codes classified as transient.
    pub retryable_status_codes: Vec<u16>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
        }
    }
}

impl ResilienceConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> FetchResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(FetchError::configuration("max_attempts must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(FetchError::configuration("base_delay must not exceed max_delay"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(FetchError::configuration("failure_threshold must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retryable_status_codes, vec![429, 502, 503, 504]);
    }

    #[test]
    fn test_invalid_configs() {
        let config = ResilienceConfig {
            retry: RetryConfig::new().max_attempts(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ResilienceConfig {
            retry: RetryConfig::new()
                .base_delay(Duration::from_secs(5))
                .max_delay(Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ResilienceConfig {
            circuit_breaker: CircuitBreakerConfig::new().failure_threshold(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
