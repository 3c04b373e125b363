//! Outcome classification.
//!
//! Every upstream attempt is turned into an [`OperationOutcome`] exactly
//! once, by [`classify`]. The retry loop and the circuit breaker only ever
//! look at the outcome, never at transport errors or status codes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::errors::{FetchError, FetchResult};
use crate::transport::TransportError;
use crate::types::RawResponse;

/// Status codes retried by default.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 4] = [429, 502, 503, 504];

const MAX_BODY_SNIPPET: usize = 200;

/// Tagged result of one attempt.
#[derive(Debug, Clone)]
pub enum OperationOutcome<T> {
    /// The attempt produced a value.
    Success(T),
    /// The attempt failed.
    Failure {
        /// The classified error.
        error: FetchError,
        /// Whether another attempt may succeed.
        retryable: bool,
    },
}

impl<T> OperationOutcome<T> {
    /// Wraps an error, taking retryability from the error itself.
    pub fn failure(error: FetchError) -> Self {
        let retryable = error.is_retryable();
        OperationOutcome::Failure { error, retryable }
    }

    /// Returns true for [`OperationOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success(_))
    }

    /// Maps the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationOutcome<U> {
        match self {
            OperationOutcome::Success(value) => OperationOutcome::Success(f(value)),
            OperationOutcome::Failure { error, retryable } => {
                OperationOutcome::Failure { error, retryable }
            }
        }
    }

    /// Converts into a plain result, dropping the retry flag.
    pub fn into_result(self) -> FetchResult<T> {
        match self {
            OperationOutcome::Success(value) => Ok(value),
            OperationOutcome::Failure { error, .. } => Err(error),
        }
    }
}

impl<T> From<FetchResult<T>> for OperationOutcome<T> {
    fn from(result: FetchResult<T>) -> Self {
        match result {
            Ok(value) => OperationOutcome::Success(value),
            Err(error) => OperationOutcome::failure(error),
        }
    }
}

/// Classifies one transport result.
///
/// - 2xx is a success carrying the body.
/// - A status in `retryable_status_codes` is a transient failure, honoring
///   `Retry-After` when present.
/// - Any other status is a permanent failure.
/// - Connection errors and timeouts are transient; unreadable responses are
///   permanent.
pub fn classify(
    result: Result<RawResponse, TransportError>,
    retryable_status_codes: &[u16],
) -> OperationOutcome<Bytes> {
    let response = match result {
        Ok(response) => response,
        Err(err) => return OperationOutcome::failure(err.into()),
    };

    if response.is_success() {
        return OperationOutcome::Success(response.body);
    }

    let status = response.status;
    let message = describe_failure(&response);

    if retryable_status_codes.contains(&status) {
        let retry_after = response.header("retry-after").and_then(parse_retry_after);
        OperationOutcome::Failure {
            error: FetchError::TransientUpstream {
                message,
                status_code: Some(status),
                retry_after,
            },
            retryable: true,
        }
    } else {
        OperationOutcome::Failure {
            error: FetchError::permanent(message, Some(status)),
            retryable: false,
        }
    }
}

fn describe_failure(response: &RawResponse) -> String {
    let body = String::from_utf8_lossy(&response.body);
    let body = body.trim();
    if body.is_empty() {
        return format!("upstream returned status {}", response.status);
    }
    let snippet: String = body.chars().take(MAX_BODY_SNIPPET).collect();
    format!("upstream returned status {}: {}", response.status, snippet)
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
