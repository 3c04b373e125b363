//! Upstream transport layer.
//!
//! The pipeline only knows the [`UpstreamSource`] trait; [`HttpUpstream`] is
//! the reqwest-backed implementation used in production.

mod http;

pub use http::HttpUpstream;

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::types::RawResponse;

/// Transport error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established or was reset.
    #[error("Connection error: {message}")]
    Connection {
        /// Error message.
        message: String,
    },

    /// The request exceeded its timeout.
    #[error("Timeout after {timeout:?}")]
    Timeout {
        /// Timeout duration.
        timeout: Duration,
    },

    /// The response could not be read.
    #[error("Invalid response: {message}")]
    InvalidResponse {
        /// Error message.
        message: String,
    },

    /// The caller cancelled the request.
    #[error("Request cancelled")]
    Cancelled,
}

/// Source of raw upstream responses.
///
/// Implementations must return promptly with [`TransportError::Cancelled`]
/// once `cancel` fires.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Fetches `path_and_query` relative to the upstream base URL.
    async fn fetch(
        &self,
        path_and_query: &str,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportError>;
}

