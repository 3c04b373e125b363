//! Sports Data Client Library
//!
//! A resilient Rust client for rate-limited sports statistics APIs. Every
//! logical fetch flows through one pipeline:
//!
//! cache → retry/circuit breaker → rate limiter → upstream
//!
//! # Features
//!
//! - **Rate Limiting**: Sliding window with burst allowance and a FIFO queue
//! - **Resilience**: Classified retries with backoff behind a circuit breaker
//! - **Caching**: Per-category TTLs with single-flight population
//! - **Bulk Fetching**: Bounded concurrency, batching and progress reporting
//! - **Observability**: Tracing, metrics, secret redaction
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sportsdata_client::{DataCategory, FetchRequest, SportsDataClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SportsDataClient::from_env()?;
//!
//!     let request = FetchRequest::builder("box_score")
//!         .endpoint("nfl/stats/json/BoxScore")
//!         .param("scoreid", 18_512)
//!         .category(DataCategory::Live)
//!         .build()?;
//!
//!     let body = client.fetch(&request).await?;
//!     println!("{}", String::from_utf8_lossy(&body));
//!     Ok(())
//! }
//! ```
//!
//! # Bulk Example
//!
//! ```rust,no_run
//! use sportsdata_client::{BatchProgress, DataCategory, FetchRequest, SportsDataClient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SportsDataClient::from_env()?;
//!
//!     let requests = (1..=25)
//!         .map(|id| {
//!             FetchRequest::builder("player")
//!                 .endpoint("nfl/scores/json/Player")
//!                 .param("playerid", id)
//!                 .category(DataCategory::Player)
//!                 .build()
//!         })
//!         .collect::<Result<Vec<_>, _>>()?;
//!
//!     let report = |p: &BatchProgress| {
//!         println!("{}/{} done", p.completed_items + p.failed_items, p.total_items);
//!     };
//!     let outcome = client
//!         .fetch_many(requests, None, &report, &CancellationToken::new())
//!         .await?;
//!     println!("{} fetched, {} failed", outcome.completed_items, outcome.failed_items);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod bulk;
pub mod cache;
pub mod client;
pub mod config;
pub mod errors;
pub mod observability;
pub mod resilience;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use bulk::{
    BatchProgress, BulkConfig, BulkOptions, BulkOrchestrator, BulkOutcome, DispatchMode,
    NoProgress, ProgressObserver,
};
pub use cache::{CacheConfig, CacheLayer, CacheStats, WarmReport};
pub use client::{ClientStatus, SportsDataClient, SportsDataClientBuilder};
pub use config::SportsDataConfig;
pub use errors::{ErrorKind, FetchError, FetchResult};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, OperationOutcome, RateLimiter,
    RateLimiterConfig, ResilienceConfig, ResilienceExecutor, RetryConfig,
};
pub use transport::{HttpUpstream, TransportError, UpstreamSource};
pub use types::{DataCategory, FetchRequest, RawResponse};

/// Mock implementations for testing.
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
