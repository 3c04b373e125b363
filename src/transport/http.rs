//! HTTP transport implementation.

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{TransportError, UpstreamSource};
use crate::auth::AuthProvider;
use crate::observability::redact_secrets;
use crate::types::RawResponse;

/// Upstream source backed by a pooled reqwest client.
pub struct HttpUpstream {
    client: Client,
    base_url: String,
    timeout: Duration,
    auth: Arc<dyn AuthProvider>,
}

impl HttpUpstream {
    /// Creates a new HTTP upstream.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, TransportError> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| TransportError::Connection {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            auth,
        })
    }

    /// Builds the full URL for a path.
    fn build_url(&self, path_and_query: &str) -> String {
        format!(
            "{}/{}",
            self.base_url,
            path_and_query.trim_start_matches('/')
        )
    }

    async fn send(&self, url: &str) -> Result<RawResponse, TransportError> {
        let mut headers = HashMap::new();
        self.auth.apply_auth(&mut headers);

        let mut req_builder = self.client.get(url).header("Accept", "application/json");
        for (name, value) in &headers {
            req_builder = req_builder.header(name, value);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    timeout: self.timeout,
                }
            } else if e.is_connect() {
                TransportError::Connection {
                    message: redact_secrets(&e.to_string()),
                }
            } else {
                TransportError::InvalidResponse {
                    message: redact_secrets(&e.to_string()),
                }
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    timeout: self.timeout,
                }
            } else {
                TransportError::InvalidResponse {
                    message: e.to_string(),
                }
            }
        })?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    #[instrument(skip_all, fields(path = %redact_secrets(path_and_query)))]
    async fn fetch(
        &self,
        path_and_query: &str,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportError> {
        let url = self.build_url(path_and_query);

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.send(&url) => {
                if let Ok(response) = &result {
                    tracing::debug!(status = response.status, bytes = response.body.len(), "Upstream responded");
                }
                result
            }
        }
    }
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("auth_scheme", &self.auth.scheme())
            .finish()
    }
}
