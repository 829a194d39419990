//! Logging and counters

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, LinkMetrics, MetricsSnapshot};

pub use logging::{bus_span, link_span};
