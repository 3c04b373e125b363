//! Circuit breaker implementation.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::FetchError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is testing, one request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Time spent open before a trial call is admitted.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the break duration.
    pub fn break_duration(mut self, duration: Duration) -> Self {
        self.break_duration = duration;
        self
    }
}

/// Hook for circuit breaker state changes.
pub trait CircuitBreakerHook: Send + Sync {
    /// Called after every transition, outside the breaker's lock.
    fn on_state_change(&self, old_state: CircuitState, new_state: CircuitState);
}

/// Read-only view of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted while closed.
    pub consecutive_failures: u32,
    /// Time until a trial call is admitted, when open.
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Circuit breaker guarding one upstream.
///
/// Calls go through [`CircuitBreaker::try_acquire`]; the returned
/// [`CallPermit`] records the outcome. While half-open exactly one permit is
/// outstanding at a time.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    hook: Option<Arc<dyn CircuitBreakerHook>>,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            hook: None,
        }
    }

    /// Adds a hook for state changes.
    pub fn with_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Returns a read-only snapshot. Never transitions.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.state.lock();
        let retry_in = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.config
                    .break_duration
                    .saturating_sub(opened_at.elapsed()),
            ),
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            retry_in,
        }
    }

    /// Asks to run one call.
    ///
    /// An open breaker whose break duration has elapsed moves to half-open
    /// and hands out the single trial permit.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, FetchError> {
        let (result, transition) = {
            let mut inner = self.state.lock();
            match inner.state {
                CircuitState::Closed => (Ok(false), None),
                CircuitState::Open => {
                    let elapsed = inner.opened_at.map_or(Duration::MAX, |t| t.elapsed());
                    if elapsed >= self.config.break_duration {
                        inner.state = CircuitState::HalfOpen;
                        inner.trial_in_flight = true;
                        (Ok(true), Some((CircuitState::Open, CircuitState::HalfOpen)))
                    } else {
                        let retry_in = self.config.break_duration - elapsed;
                        (Err(FetchError::CircuitOpen { retry_in }), None)
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        (
                            Err(FetchError::CircuitOpen {
                                retry_in: Duration::ZERO,
                            }),
                            None,
                        )
                    } else {
                        inner.trial_in_flight = true;
                        (Ok(true), None)
                    }
                }
            }
        };
        self.notify(transition);

        result.map(|trial| CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Forces the breaker back to closed.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.state.lock();
            let old = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.trial_in_flight = false;
            (old != CircuitState::Closed).then_some((old, CircuitState::Closed))
        };
        self.notify(transition);
    }

    fn on_success(&self, trial: bool) {
        let transition = {
            let mut inner = self.state.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if trial => {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.trial_in_flight = false;
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                }
                // A call admitted before the breaker opened finished late.
                _ => None,
            }
        };
        self.notify(transition);
    }

    fn on_failure(&self, trial: bool) {
        let transition = {
            let mut inner = self.state.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Instant::now());
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if trial => {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.trial_in_flight = false;
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    fn release_trial(&self) {
        let mut inner = self.state.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn notify(&self, transition: Transition) {
        let Some((old, new)) = transition else {
            return;
        };

        match new {
            CircuitState::Open => tracing::warn!(
                from = %old,
                threshold = self.config.failure_threshold,
                break_ms = self.config.break_duration.as_millis(),
                "Circuit breaker opening"
            ),
            CircuitState::HalfOpen => {
                tracing::info!("Circuit breaker transitioning to half-open");
            }
            CircuitState::Closed => tracing::info!(from = %old, "Circuit breaker closing"),
        }

        if let Some(hook) = &self.hook {
            hook.on_state_change(old, new);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Admission for one call through the breaker.
///
/// Dropping a permit without recording an outcome (for example when the call
/// is cancelled) frees the half-open trial slot and counts nothing.
#[must_use = "record the call outcome on the permit"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Returns true if this is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Records a successful call.
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// Records a failed call.
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
