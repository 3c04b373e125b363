//! Authentication for upstream requests.
//!
//! Sports data APIs authenticate with a subscription key sent as a request
//! header. The key is held as a [`SecretString`] and never logged.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;

use crate::errors::FetchError;

/// Default header carrying the subscription key.
pub const DEFAULT_API_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Returns `...` plus the last four characters of `key`, or `****` when the
/// key has four characters or fewer.
pub fn key_hint(key: &str) -> String {
    let count = key.chars().count();
    if count > 4 {
        let tail: String = key.chars().skip(count - 4).collect();
        format!("...{tail}")
    } else {
        "****".to_string()
    }
}

/// Authentication provider trait.
pub trait AuthProvider: Send + Sync {
    /// Apply authentication to request headers.
    fn apply_auth(&self, headers: &mut HashMap<String, String>);

    /// Get the authentication scheme name.
    fn scheme(&self) -> &str;

    /// Validate the credentials.
    fn validate(&self) -> Result<(), FetchError>;
}

/// Subscription-key authentication provider.
pub struct ApiKeyAuth {
    api_key: SecretString,
    header_name: String,
}

impl ApiKeyAuth {
    /// Creates a provider sending the key in the default header.
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            header_name: DEFAULT_API_KEY_HEADER.to_string(),
        }
    }

    /// Creates from a string API key.
    pub fn from_string(api_key: impl Into<String>) -> Self {
        Self::new(SecretString::new(api_key.into()))
    }

    /// Sends the key in a different header.
    pub fn with_header_name(mut self, header_name: impl Into<String>) -> Self {
        self.header_name = header_name.into();
        self
    }

    /// Gets a hint of the API key for debugging (last 4 characters).
    pub fn key_hint(&self) -> String {
        key_hint(self.api_key.expose_secret())
    }
}

impl AuthProvider for ApiKeyAuth {
    fn apply_auth(&self, headers: &mut HashMap<String, String>) {
        headers.insert(
            self.header_name.clone(),
            self.api_key.expose_secret().clone(),
        );
    }

    fn scheme(&self) -> &str {
        "ApiKey"
    }

    fn validate(&self) -> Result<(), FetchError> {
        let key = self.api_key.expose_secret();

        if key.trim().is_empty() {
            return Err(FetchError::configuration("API key cannot be empty"));
        }
        if key.chars().any(char::is_whitespace) {
            return Err(FetchError::configuration("API key must not contain whitespace"));
        }

        Ok(())
    }
}

impl std::fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("api_key", &"[REDACTED]")
            .field("key_hint", &self.key_hint())
            .field("header_name", &self.header_name)
            .finish()
    }
}
