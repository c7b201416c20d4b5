//! Observability for AMP runtimes: subscriber setup and lock-free counters.

#![warn(missing_docs, clippy::pedantic)]

mod metrics;
mod tracing_support;

pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use tracing_support::{TelemetryError, init_tracing};
