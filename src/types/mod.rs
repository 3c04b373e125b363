//! Request and response types shared across the pipeline.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::escape_key_component;
use crate::errors::{FetchError, FetchResult};

/// Data category tag; selects the cache TTL for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DataCategory {
    /// In-game scores and play-by-play.
    Live,
    /// Fixtures and game schedules.
    Schedule,
    /// Season-level metadata.
    Season,
    /// Team rosters and profiles.
    Team,
    /// Player profiles.
    Player,
    /// Per-player statistics.
    PlayerStats,
    /// Projections and forecasts.
    Projections,
    /// Anything without a dedicated policy.
    #[default]
    Default,
}

impl DataCategory {
    /// All categories, in declaration order.
    pub const ALL: [DataCategory; 8] = [
        DataCategory::Live,
        DataCategory::Schedule,
        DataCategory::Season,
        DataCategory::Team,
        DataCategory::Player,
        DataCategory::PlayerStats,
        DataCategory::Projections,
        DataCategory::Default,
    ];

    /// Returns the category name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::Live => "live",
            DataCategory::Schedule => "schedule",
            DataCategory::Season => "season",
            DataCategory::Team => "team",
            DataCategory::Player => "player",
            DataCategory::PlayerStats => "player-stats",
            DataCategory::Projections => "projections",
            DataCategory::Default => "default",
        }
    }
}

impl std::fmt::Display for DataCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataCategory {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        DataCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| FetchError::configuration(format!("Unknown data category '{s}'")))
    }
}

/// One logical fetch against the upstream API.
///
/// Immutable once built; use [`FetchRequest::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    operation: String,
    endpoint: String,
    category: DataCategory,
    params: Vec<(String, String)>,
    ttl_override: Option<Duration>,
}

impl FetchRequest {
    /// Creates a request builder for the given operation identifier.
    pub fn builder(operation: impl Into<String>) -> FetchRequestBuilder {
        FetchRequestBuilder::new(operation)
    }

    /// Returns the operation identifier.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Returns the endpoint path without query string.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the data category.
    pub fn category(&self) -> DataCategory {
        self.category
    }

    /// Returns the ordered query parameters.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Returns the TTL override, if any.
    pub fn ttl_override(&self) -> Option<Duration> {
        self.ttl_override
    }

    /// Returns the cache key: `operation:endpoint[:name=value...]`.
    ///
    /// Names and values are escaped separately, so requests differing in
    /// endpoint, parameter name or parameter value never share a key.
    pub fn cache_key(&self) -> String {
        let mut key = format!(
            "{}:{}",
            escape_key_component(&self.operation),
            escape_key_component(&self.endpoint)
        );
        for (name, value) in &self.params {
            key.push(':');
            key.push_str(&escape_key_component(name));
            key.push('=');
            key.push_str(&escape_key_component(value));
        }
        key
    }

    /// Returns the endpoint path with the URL-encoded query string.
    pub fn path_and_query(&self) -> String {
        if self.params.is_empty() {
            return self.endpoint.clone();
        }
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish();
        format!("{}?{}", self.endpoint, query)
    }
}

/// Builder for [`FetchRequest`].
#[derive(Debug, Default)]
pub struct FetchRequestBuilder {
    operation: String,
    endpoint: Option<String>,
    category: DataCategory,
    params: Vec<(String, String)>,
    ttl_override: Option<Duration>,
}

impl FetchRequestBuilder {
    /// Creates a new builder.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    /// Sets the endpoint path.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the data category.
    pub fn category(mut self, category: DataCategory) -> Self {
        self.category = category;
        self
    }

    /// Appends a query parameter. Order is preserved.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    /// Overrides the category TTL for this request.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }

    /// Builds the request.
    pub fn build(self) -> FetchResult<FetchRequest> {
        if self.operation.trim().is_empty() {
            return Err(FetchError::configuration("Operation identifier is required"));
        }
        let endpoint = self
            .endpoint
            .ok_or_else(|| FetchError::configuration("Endpoint is required"))?;

        Ok(FetchRequest {
            operation: self.operation,
            endpoint: format!("/{}", endpoint.trim_start_matches('/')),
            category: self.category,
            params: self.params,
            ttl_override: self.ttl_override,
        })
    }
}

/// A raw upstream response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, names lower-cased.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Bytes,
}

impl RawResponse {
    /// Creates a response with no headers.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Returns true if the status indicates success (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Looks up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}
