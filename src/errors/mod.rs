//! Error types for the sports data client.
//!
//! Every failure a caller can observe is a [`FetchError`]. Upstream failures
//! are split into transient (retried) and permanent (surfaced at once); the
//! remaining variants are raised locally by the pipeline itself.

use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

/// Result type alias for pipeline operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Error type for every stage of the fetch pipeline.
///
/// `Clone` is required because one single-flight failure is handed to every
/// caller that joined the flight.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// A queued rate-limit waiter reached its deadline.
    #[error("Rate limit wait timed out after {waited:?}")]
    RateLimitTimeout {
        /// How long the caller waited in the queue.
        waited: Duration,
    },

    /// The circuit breaker rejected the call without invoking upstream.
    #[error("Circuit breaker open: retry in {retry_in:?}")]
    CircuitOpen {
        /// Time until the breaker admits a trial call.
        retry_in: Duration,
    },

    /// Upstream failed in a way that may succeed on retry.
    #[error("Transient upstream failure{}: {message}", fmt_status(.status_code))]
    TransientUpstream {
        /// Error message.
        message: String,
        /// HTTP status code, if the failure came from a response.
        status_code: Option<u16>,
        /// Delay requested by the upstream via `Retry-After`.
        retry_after: Option<Duration>,
    },

    /// Upstream failed in a way that will not succeed on retry.
    #[error("Permanent upstream failure{}: {message}", fmt_status(.status_code))]
    PermanentUpstream {
        /// Error message.
        message: String,
        /// HTTP status code, if the failure came from a response.
        status_code: Option<u16>,
    },

    /// One item of a bulk job failed.
    #[error("Batch item {index} failed: {message}")]
    BatchItem {
        /// Position of the item in the submitted list.
        index: usize,
        /// Error message of the underlying failure.
        message: String,
    },

    /// The operation was aborted by its caller.
    #[error("Operation cancelled: {reason}")]
    Cancelled {
        /// Why the operation stopped.
        reason: String,
    },

    /// Invalid configuration or arguments.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message describing the configuration issue.
        message: String,
    },
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// Stable, low-cardinality label for an error, used by metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// [`FetchError::RateLimitTimeout`].
    RateLimitTimeout,
    /// [`FetchError::CircuitOpen`].
    CircuitOpen,
    /// [`FetchError::TransientUpstream`].
    TransientUpstream,
    /// [`FetchError::PermanentUpstream`].
    PermanentUpstream,
    /// [`FetchError::BatchItem`].
    BatchItem,
    /// [`FetchError::Cancelled`].
    Cancelled,
    /// [`FetchError::Configuration`].
    Configuration,
}

impl ErrorKind {
    /// Returns the label used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimitTimeout => "rate_limit_timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::TransientUpstream => "transient_upstream",
            ErrorKind::PermanentUpstream => "permanent_upstream",
            ErrorKind::BatchItem => "batch_item",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FetchError {
    /// Returns true if the resilience executor may retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::TransientUpstream { .. })
    }

    /// Returns the retry-after duration if the upstream supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::TransientUpstream { retry_after, .. } => *retry_after,
            FetchError::CircuitOpen { retry_in } => Some(*retry_in),
            _ => None,
        }
    }

    /// Returns true if this error counts toward opening the circuit.
    ///
    /// Only upstream outcomes count; locally raised errors never do.
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(
            self,
            FetchError::TransientUpstream { .. } | FetchError::PermanentUpstream { .. }
        )
    }

    /// Returns the HTTP status code attached to an upstream error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::TransientUpstream { status_code, .. }
            | FetchError::PermanentUpstream { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// Returns the metrics label for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::RateLimitTimeout { .. } => ErrorKind::RateLimitTimeout,
            FetchError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            FetchError::TransientUpstream { .. } => ErrorKind::TransientUpstream,
            FetchError::PermanentUpstream { .. } => ErrorKind::PermanentUpstream,
            FetchError::BatchItem { .. } => ErrorKind::BatchItem,
            FetchError::Cancelled { .. } => ErrorKind::Cancelled,
            FetchError::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        FetchError::Configuration {
            message: message.into(),
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        FetchError::Cancelled {
            reason: reason.into(),
        }
    }

    /// Creates a transient upstream error.
    pub fn transient(message: impl Into<String>, status_code: Option<u16>) -> Self {
        FetchError::TransientUpstream {
            message: message.into(),
            status_code,
            retry_after: None,
        }
    }

    /// Creates a permanent upstream error.
    pub fn permanent(message: impl Into<String>, status_code: Option<u16>) -> Self {
        FetchError::PermanentUpstream {
            message: message.into(),
            status_code,
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connection { .. } | TransportError::Timeout { .. } => {
                FetchError::transient(err.to_string(), None)
            }
            TransportError::InvalidResponse { .. } => FetchError::permanent(err.to_string(), None),
            TransportError::Cancelled => FetchError::cancelled("upstream request cancelled"),
        }
    }
}

impl From<regex::Error> for FetchError {
    fn from(err: regex::Error) -> Self {
        FetchError::Configuration {
            message: format!("Invalid pattern: {err}"),
        }
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::Configuration {
            message: format!("Invalid URL: {err}"),
        }
    }
}
