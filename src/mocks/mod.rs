//! Mock implementations for testing.
//!
//! Provides a scripted upstream source so the pipeline can be exercised
//! without making real API calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::transport::{TransportError, UpstreamSource};
use crate::types::RawResponse;

type Scripted = Result<RawResponse, TransportError>;

/// Mock upstream source with scripted responses.
///
/// Queued results are returned in order; once the queue is empty the default
/// response is used, or a 500 if none was set.
pub struct MockUpstream {
    responses: Mutex<VecDeque<Scripted>>,
    default_response: Mutex<Option<RawResponse>>,
    paths: Mutex<Vec<String>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockUpstream {
    /// Creates a new mock upstream.
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: Mutex::new(None),
            paths: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    /// Queues a response.
    pub fn queue_response(&self, response: RawResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a transport error.
    pub fn queue_error(&self, error: TransportError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Sets the response used once the queue is empty.
    pub fn set_default(&self, response: RawResponse) {
        *self.default_response.lock() = Some(response);
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Returns how many fetches were made.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the requested paths in call order.
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }

    fn next_response(&self) -> Scripted {
        if let Some(scripted) = self.responses.lock().pop_front() {
            return scripted;
        }
        Ok(self
            .default_response
            .lock()
            .clone()
            .unwrap_or_else(|| RawResponse::new(500, "no scripted response")))
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamSource for MockUpstream {
    async fn fetch(
        &self,
        path_and_query: &str,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().push(path_and_query.to_string());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
        self.next_response()
    }
}

#[cfg(test)]
mockall::mock! {
    pub UpstreamSource {}

    #[async_trait]
    impl UpstreamSource for UpstreamSource {
        async fn fetch(
            &self,
            path_and_query: &str,
            cancel: &CancellationToken,
        ) -> Result<RawResponse, TransportError>;
    }
}
