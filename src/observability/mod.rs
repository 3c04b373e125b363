//! Observability for the fetch pipeline.
//!
//! Structured logging goes through `tracing`; [`init_tracing`] installs a
//! subscriber for binaries that do not bring their own. Counters are kept by
//! a [`MetricsCollector`].

mod logging;
mod metrics;

pub use logging::{init_tracing, redact_secrets, LogConfig, LogFormat};
pub use metrics::{CircuitMetricsHook, DefaultMetricsCollector, FetchMetrics, MetricsCollector};
