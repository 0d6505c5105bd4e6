//! Observability: structured logging and counters
//!
//! Logging goes through `tracing`; counters are plain atomics exposed as
//! serializable snapshots.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{rest_metrics, ConnectionMetrics, MetricsSnapshot, RestMetricsSnapshot};

pub use logging::{mqtt_span, rest_span};
